//! Background retry loop
//!
//! Polls the retry queue on a fixed interval, claims due entries (claiming
//! deletes them), and resubmits each to [`EventIngress`] with the payload
//! stored in the ledger.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{PipelineError, PipelineResult};
use crate::ingress::{EventIngress, ProcessOutcome};
use crate::retry_queue::RetryQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryWorkerConfig {
    pub poll_interval: Duration,
    /// Maximum entries claimed per poll
    pub batch_size: usize,
    /// Maximum entries resubmitted at once
    pub concurrency: usize,
}

impl Default for RetryWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            concurrency: 8,
        }
    }
}

/// Tally of one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryBatchReport {
    pub claimed: usize,
    pub processed: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Already handled elsewhere, or missing from the ledger
    pub skipped: usize,
    pub errors: usize,
}

impl RetryBatchReport {
    fn record(&mut self, result: &PipelineResult<ProcessOutcome>) {
        match result {
            Ok(ProcessOutcome::Processed) | Ok(ProcessOutcome::Ignored) => self.processed += 1,
            Ok(ProcessOutcome::RetryScheduled { .. }) | Ok(ProcessOutcome::RetryDeferred { .. }) => {
                self.rescheduled += 1
            }
            Ok(ProcessOutcome::DeadLettered { .. }) => self.dead_lettered += 1,
            Ok(ProcessOutcome::AlreadyProcessed) | Ok(ProcessOutcome::InFlight) => {
                self.skipped += 1
            }
            Err(PipelineError::NotFound(_)) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
    }
}

pub struct RetryWorker {
    ingress: Arc<EventIngress>,
    queue: Arc<dyn RetryQueue>,
    clock: Arc<dyn Clock>,
    config: RetryWorkerConfig,
}

impl RetryWorker {
    pub fn new(
        ingress: Arc<EventIngress>,
        queue: Arc<dyn RetryQueue>,
        clock: Arc<dyn Clock>,
        config: RetryWorkerConfig,
    ) -> Self {
        Self {
            ingress,
            queue,
            clock,
            config,
        }
    }

    /// Poll until `shutdown` is cancelled. A poll in progress is finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "Retry worker started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.claimed > 0 => {
                            tracing::info!(
                                claimed = report.claimed,
                                processed = report.processed,
                                rescheduled = report.rescheduled,
                                dead_lettered = report.dead_lettered,
                                skipped = report.skipped,
                                errors = report.errors,
                                "Retry batch complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to claim due retries");
                        }
                    }
                }
            }
        }

        tracing::info!("Retry worker stopped");
    }

    /// Claim and resubmit one batch of due entries
    pub async fn run_once(&self) -> PipelineResult<RetryBatchReport> {
        let now = self.clock.now();
        let limit = i64::try_from(self.config.batch_size).unwrap_or(i64::MAX);
        let entries = self.queue.claim_due(now, limit).await?;

        let mut report = RetryBatchReport {
            claimed: entries.len(),
            ..RetryBatchReport::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        let ingress = &self.ingress;
        let results: Vec<PipelineResult<ProcessOutcome>> = stream::iter(entries)
            .map(|entry| async move {
                let result = ingress.process_retry(&entry).await;
                if let Err(ref e) = result {
                    if !matches!(e, PipelineError::NotFound(_)) {
                        tracing::error!(
                            event_id = %entry.event_id,
                            event_type = %entry.event_type,
                            attempt_number = entry.attempt_number,
                            error = %e,
                            "Retry attempt could not be processed"
                        );
                    }
                }
                result
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for result in &results {
            report.record(result);
        }
        Ok(report)
    }
}
