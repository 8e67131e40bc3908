//! Operational counts for dashboards and alerting

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;

use crate::clock::Clock;
use crate::error::PipelineResult;
use crate::ledger::EventLedger;
use crate::retry_queue::RetryQueue;

/// Snapshot of pipeline health over a recent window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
    pub total_seen: i64,
    pub processed: i64,
    pub processing: i64,
    pub failed_retrying: i64,
    /// Permanently failed; needs manual investigation
    pub dead_lettered: i64,
    /// Pending retries right now, regardless of window
    pub queued_for_retry: i64,
}

#[derive(Clone)]
pub struct PipelineMetrics {
    ledger: Arc<dyn EventLedger>,
    queue: Arc<dyn RetryQueue>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl PipelineMetrics {
    pub fn new(
        ledger: Arc<dyn EventLedger>,
        queue: Arc<dyn RetryQueue>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            ledger,
            queue,
            clock,
            max_attempts,
        }
    }

    pub async fn snapshot(&self, window: Duration) -> PipelineResult<PipelineStats> {
        let window_start = self.clock.now() - window;
        let ledger = self
            .ledger
            .stats_since(window_start, self.max_attempts)
            .await?;
        let queued_for_retry = self.queue.count().await?;

        Ok(PipelineStats {
            window_start,
            total_seen: ledger.total_seen,
            processed: ledger.processed,
            processing: ledger.processing,
            failed_retrying: ledger.failed_retrying,
            dead_lettered: ledger.dead_lettered,
            queued_for_retry,
        })
    }

    /// Log a snapshot; dead letters are logged at warn level so they surface in alerting
    pub async fn log_snapshot(&self, window: Duration) {
        match self.snapshot(window).await {
            Ok(stats) if stats.dead_lettered > 0 => tracing::warn!(
                total_seen = stats.total_seen,
                processed = stats.processed,
                processing = stats.processing,
                failed_retrying = stats.failed_retrying,
                dead_lettered = stats.dead_lettered,
                queued_for_retry = stats.queued_for_retry,
                "Pipeline stats (dead-lettered events present)"
            ),
            Ok(stats) => tracing::info!(
                total_seen = stats.total_seen,
                processed = stats.processed,
                processing = stats.processing,
                failed_retrying = stats.failed_retrying,
                dead_lettered = stats.dead_lettered,
                queued_for_retry = stats.queued_for_retry,
                "Pipeline stats"
            ),
            Err(e) => tracing::error!(error = %e, "Failed to collect pipeline stats"),
        }
    }
}
