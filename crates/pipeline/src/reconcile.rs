//! Reconciliation sweep
//!
//! Repairs the states the hot path can leave behind:
//!
//! 1. **Stale claims**: a worker crashed (or lost its database connection)
//!    between claiming an event and recording the outcome, leaving the row in
//!    `processing`. Claims older than the processing timeout are recorded as a
//!    failed attempt and go through the normal retry/dead-letter decision. The
//!    takeover is conditional on the claim time, so a claim taken after the
//!    listing is left alone.
//! 2. **Unclaimed events**: the row was recorded as `received` but never
//!    claimed, because the claim query failed or the process died in between.
//!    After a grace period the event is run through ingress like a delivery.
//! 3. **Orphaned failures**: a row is `failed` with attempts left but has no
//!    retry queue entry, because the queue write failed or a claimed retry
//!    could not be resubmitted. A retry is scheduled for it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::clock::Clock;
use crate::error::PipelineResult;
use crate::event::EventStatus;
use crate::ingress::EventIngress;
use crate::ledger::EventLedger;
use crate::retry_queue::RetryQueue;
use crate::scheduler::RetryScheduler;

/// Default age after which a `processing` claim is considered abandoned
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default time a `received` row may wait for its first claim
pub const DEFAULT_RECEIVED_GRACE: Duration = Duration::from_secs(5 * 60);

const STALE_CLAIM_MESSAGE: &str = "processing timed out";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub processing_timeout: Duration,
    pub received_grace: Duration,
    /// Rows examined per pass, per category
    pub batch_size: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            received_grace: DEFAULT_RECEIVED_GRACE,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub stale_recovered: usize,
    pub unclaimed_processed: usize,
    pub orphans_rescheduled: usize,
    pub errors: usize,
}

pub struct Reconciler {
    ingress: Arc<EventIngress>,
    ledger: Arc<dyn EventLedger>,
    queue: Arc<dyn RetryQueue>,
    scheduler: RetryScheduler,
    clock: Arc<dyn Clock>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        ingress: Arc<EventIngress>,
        ledger: Arc<dyn EventLedger>,
        queue: Arc<dyn RetryQueue>,
        scheduler: RetryScheduler,
        clock: Arc<dyn Clock>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            ingress,
            ledger,
            queue,
            scheduler,
            clock,
            config,
        }
    }

    pub async fn sweep(&self) -> PipelineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.recover_stale_claims(&mut report).await?;
        self.process_unclaimed(&mut report).await?;
        self.reschedule_orphans(&mut report).await?;

        if report != ReconcileReport::default() {
            tracing::info!(
                stale_recovered = report.stale_recovered,
                unclaimed_processed = report.unclaimed_processed,
                orphans_rescheduled = report.orphans_rescheduled,
                errors = report.errors,
                "Reconciliation sweep complete"
            );
        }
        Ok(report)
    }

    async fn recover_stale_claims(&self, report: &mut ReconcileReport) -> PipelineResult<()> {
        let cutoff = self.clock.now() - self.config.processing_timeout;
        let stale = self
            .ledger
            .list_stale_processing(cutoff, self.config.batch_size)
            .await?;

        for event in stale {
            match self
                .ingress
                .recover_stale_claim(&event, cutoff, STALE_CLAIM_MESSAGE)
                .await
            {
                Ok(Some(outcome)) => {
                    tracing::warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        processing_started_at = ?event.processing_started_at,
                        outcome = ?outcome,
                        "Recovered event stuck in 'processing'"
                    );
                    report.stale_recovered += 1;
                }
                Ok(None) => {
                    tracing::debug!(
                        event_id = %event.id,
                        "Claim finished or was re-taken since listing - leaving it"
                    );
                }
                Err(e) => {
                    tracing::warn!(event_id = %event.id, error = %e, "Failed to recover stale claim");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    async fn process_unclaimed(&self, report: &mut ReconcileReport) -> PipelineResult<()> {
        let cutoff = self.clock.now() - self.config.received_grace;
        let unclaimed = self
            .ledger
            .list_unclaimed(cutoff, self.config.batch_size)
            .await?;

        for event in unclaimed {
            match self
                .ingress
                .process(&event.id, &event.event_type, event.payload)
                .await
            {
                Ok(outcome) => {
                    tracing::info!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        outcome = ?outcome,
                        "Processed event left unclaimed"
                    );
                    report.unclaimed_processed += 1;
                }
                Err(e) => {
                    tracing::warn!(event_id = %event.id, error = %e, "Failed to process unclaimed event");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    async fn reschedule_orphans(&self, report: &mut ReconcileReport) -> PipelineResult<()> {
        let max_attempts = self.scheduler.policy().max_attempts;
        let failed = self
            .ledger
            .list_retriable_failures(max_attempts, self.config.batch_size)
            .await?;

        for event in failed {
            match self.queue.get(&event.id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(event_id = %event.id, error = %e, "Failed to check retry queue");
                    report.errors += 1;
                    continue;
                }
            }

            // The listing may be stale; schedule from the row as it is now
            let current = match self.ledger.lookup(&event.id).await {
                Ok(Some(current))
                    if current.status == EventStatus::Failed
                        && current.attempts < max_attempts =>
                {
                    current
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(event_id = %event.id, error = %e, "Failed to re-read event");
                    report.errors += 1;
                    continue;
                }
            };

            match self
                .scheduler
                .schedule_retry(&current.id, &current.event_type, current.attempts)
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        event_id = %current.id,
                        event_type = %current.event_type,
                        attempts = current.attempts,
                        "Rescheduled orphaned failed event"
                    );
                    report.orphans_rescheduled += 1;
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %current.id,
                        error = %e,
                        "Failed to reschedule orphaned failed event"
                    );
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }
}
