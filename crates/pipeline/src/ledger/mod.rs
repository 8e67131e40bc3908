//! Event ledger
//!
//! Durable record of every event ever received, keyed by the upstream event id.
//! `try_claim` is the only guard against two callers running a handler for the
//! same id at once, so every implementation must perform it as a single
//! conditional write.

mod memory;
mod postgres;

pub use memory::InMemoryEventLedger;
pub use postgres::PgEventLedger;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::PipelineResult;
use crate::event::{Event, EventStatus, LedgerStats};

#[async_trait]
pub trait EventLedger: Send + Sync {
    async fn lookup(&self, id: &str) -> PipelineResult<Option<Event>>;

    /// Insert a `received` row, or return the existing row unchanged
    async fn record_received(
        &self,
        id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> PipelineResult<Event>;

    /// Move the row to `processing` if it is `received`, or `failed` with
    /// `attempts < max_attempts`. Returns whether this caller won the claim.
    async fn try_claim(&self, id: &str, max_attempts: u32) -> PipelineResult<bool>;

    async fn mark_processed(&self, id: &str) -> PipelineResult<()>;

    /// Record a failed attempt and return the new attempt count
    async fn mark_failed(&self, id: &str, error_message: &str) -> PipelineResult<u32>;

    /// Record a failure that must never be retried; attempts jump to at least `max_attempts`
    async fn mark_dead_lettered(
        &self,
        id: &str,
        error_message: &str,
        max_attempts: u32,
    ) -> PipelineResult<u32>;

    /// Newest first
    async fn list(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> PipelineResult<Vec<Event>>;

    /// `failed` rows that still have attempts left, oldest first
    async fn list_retriable_failures(
        &self,
        max_attempts: u32,
        limit: i64,
    ) -> PipelineResult<Vec<Event>>;

    /// `processing` rows claimed before `claimed_before`
    async fn list_stale_processing(
        &self,
        claimed_before: OffsetDateTime,
        limit: i64,
    ) -> PipelineResult<Vec<Event>>;

    /// Record a timed-out attempt, but only if the row is still `processing`
    /// under a claim taken before `claimed_before`. Returns the new attempt
    /// count, or `None` when the claim has since finished or been re-taken.
    async fn fail_stale_claim(
        &self,
        id: &str,
        claimed_before: OffsetDateTime,
        error_message: &str,
    ) -> PipelineResult<Option<u32>>;

    /// `received` rows created before `received_before` that nobody claimed, oldest first
    async fn list_unclaimed(
        &self,
        received_before: OffsetDateTime,
        limit: i64,
    ) -> PipelineResult<Vec<Event>>;

    /// Counts over rows created at or after `since`
    async fn stats_since(
        &self,
        since: OffsetDateTime,
        max_attempts: u32,
    ) -> PipelineResult<LedgerStats>;
}
