//! Retry queue
//!
//! Durable pending retries, at most one per event. Entries are removed at the
//! moment they are claimed, so no two workers can ever hold the same entry.

mod memory;
mod postgres;

pub use memory::InMemoryRetryQueue;
pub use postgres::PgRetryQueue;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::PipelineResult;
use crate::event::RetryEntry;

#[async_trait]
pub trait RetryQueue: Send + Sync {
    /// Insert the entry, replacing any pending entry for the same event
    async fn schedule(&self, entry: RetryEntry) -> PipelineResult<()>;

    /// Remove and return up to `limit` entries with `retry_at <= now`, earliest first
    async fn claim_due(&self, now: OffsetDateTime, limit: i64) -> PipelineResult<Vec<RetryEntry>>;

    async fn get(&self, event_id: &str) -> PipelineResult<Option<RetryEntry>>;

    /// Drop the pending entry for an event; returns whether one existed
    async fn cancel(&self, event_id: &str) -> PipelineResult<bool>;

    async fn count(&self) -> PipelineResult<i64>;
}
