//! Ledger and retry-queue records

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::PipelineError;

/// Processing state of a ledger row
///
/// `received -> processing -> processed` is the happy path. `processing -> failed`
/// may be followed by `failed -> processing` while attempts remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Received,
    Processing,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Received => "received",
            EventStatus::Processing => "processing",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(EventStatus::Received),
            "processing" => Ok(EventStatus::Processing),
            "processed" => Ok(EventStatus::Processed),
            "failed" => Ok(EventStatus::Failed),
            other => Err(PipelineError::InvalidInput(format!(
                "Unknown event status: {}",
                other
            ))),
        }
    }
}

/// One row per distinct upstream event id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: String,
    pub event_type: String,
    /// Stored verbatim for replay and audit
    pub payload: serde_json::Value,
    pub status: EventStatus,
    /// Completed handler invocations that failed
    pub attempts: u32,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

impl Event {
    /// Failed with no attempts left
    pub fn is_dead_lettered(&self, max_attempts: u32) -> bool {
        self.status == EventStatus::Failed && self.attempts >= max_attempts
    }
}

/// A pending retry; at most one per event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryEntry {
    pub event_id: String,
    pub event_type: String,
    /// 1-based number of the handler invocation this entry will perform
    pub attempt_number: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub retry_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl RetryEntry {
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        now >= self.retry_at
    }
}

/// Ledger counts over a time window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total_seen: i64,
    pub processed: i64,
    pub processing: i64,
    /// Failed but still eligible for retry
    pub failed_retrying: i64,
    pub dead_lettered: i64,
}
