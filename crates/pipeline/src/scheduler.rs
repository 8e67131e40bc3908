//! Retry scheduling with exponential backoff

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::PipelineResult;
use crate::event::RetryEntry;
use crate::retry_queue::RetryQueue;

/// Default handler invocations per event before dead-lettering
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempts` recorded failures:
    /// `base * 2^(attempts - 1)`, so 1s, 2s, 4s... capped at `max_delay`
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[derive(Clone)]
pub struct RetryScheduler {
    queue: Arc<dyn RetryQueue>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryScheduler {
    pub fn new(queue: Arc<dyn RetryQueue>, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue the next attempt for an event that has failed `attempts` times.
    /// Replaces any pending entry for the same event.
    pub async fn schedule_retry(
        &self,
        event_id: &str,
        event_type: &str,
        attempts: u32,
    ) -> PipelineResult<RetryEntry> {
        let now = self.clock.now();
        let delay = self.policy.delay_for(attempts);
        let entry = RetryEntry {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            attempt_number: attempts + 1,
            retry_at: now + delay,
            created_at: now,
        };

        self.queue.schedule(entry.clone()).await?;

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            attempt_number = entry.attempt_number,
            delay_ms = delay.as_millis() as u64,
            retry_at = %entry.retry_at,
            "Scheduled event retry"
        );

        Ok(entry)
    }
}
