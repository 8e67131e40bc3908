//! Event ingress
//!
//! Entry point for every inbound delivery and every queued retry. Decides
//! whether the event needs work, claims it, dispatches it, and records the
//! outcome in the ledger.
//!
//! ## Idempotency
//!
//! The status checks after `record_received` are a fast path and may read a
//! stale row. The real guard is `EventLedger::try_claim`, a single conditional
//! write: of any number of concurrent deliveries of one id, exactly one wins it
//! and runs the handler. Losers return success without doing any work.
//!
//! ## Acknowledgment
//!
//! Handler failures never surface as `Err`; they are recorded and retried.
//! `process` only returns `Err` when the event could not be durably recorded,
//! which is the one case where the upstream provider should redeliver.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{HandlerError, PipelineError, PipelineResult};
use crate::event::{Event, EventStatus, RetryEntry};
use crate::ledger::EventLedger;
use crate::retry_queue::RetryQueue;
use crate::scheduler::{RetryPolicy, RetryScheduler};

/// Base of the backoff used when a post-dispatch ledger write fails (10ms, 100ms)
const BOOKKEEPING_RETRY_BASE_MS: u64 = 10;
const BOOKKEEPING_RETRIES: usize = 2;

/// Result of handing one event to the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// The handler ran and succeeded
    Processed,
    /// No handler is registered; recorded as processed
    Ignored,
    /// An earlier delivery already processed this id
    AlreadyProcessed,
    /// Another caller currently owns this id
    InFlight,
    /// The handler failed and another attempt is queued
    RetryScheduled {
        attempts: u32,
        #[serde(with = "time::serde::rfc3339")]
        retry_at: OffsetDateTime,
    },
    /// The handler failed, attempts remain, but the retry could not be queued;
    /// the reconciliation sweep will queue it
    RetryDeferred { attempts: u32 },
    /// Attempts are exhausted or the failure was permanent
    DeadLettered { attempts: u32, error: String },
}

impl ProcessOutcome {
    /// Whether the event's effect has been applied, or is being applied elsewhere
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ProcessOutcome::Processed
                | ProcessOutcome::Ignored
                | ProcessOutcome::AlreadyProcessed
                | ProcessOutcome::InFlight
        )
    }

    /// Every outcome means the event is durably recorded, so the delivery
    /// should be acknowledged to stop upstream redelivery
    pub fn should_ack(&self) -> bool {
        true
    }
}

pub struct EventIngress {
    ledger: Arc<dyn EventLedger>,
    queue: Arc<dyn RetryQueue>,
    dispatcher: Dispatcher,
    scheduler: RetryScheduler,
}

impl EventIngress {
    pub fn new(
        ledger: Arc<dyn EventLedger>,
        queue: Arc<dyn RetryQueue>,
        dispatcher: Dispatcher,
        scheduler: RetryScheduler,
    ) -> Self {
        Self {
            ledger,
            queue,
            dispatcher,
            scheduler,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.scheduler.policy()
    }

    /// Process one delivery of an event
    pub async fn process(
        &self,
        id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> PipelineResult<ProcessOutcome> {
        if id.trim().is_empty() {
            return Err(PipelineError::InvalidInput("Event id is empty".to_string()));
        }
        if event_type.trim().is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "Event {} has an empty type",
                id
            )));
        }

        let max_attempts = self.policy().max_attempts;
        let event = self
            .ledger
            .record_received(id, event_type, &payload)
            .await
            .map_err(|e| {
                tracing::error!(
                    event_id = %id,
                    event_type = %event_type,
                    error = %e,
                    "Failed to record inbound event"
                );
                e
            })?;

        match event.status {
            EventStatus::Processed => {
                tracing::info!(
                    event_id = %id,
                    event_type = %event.event_type,
                    "Duplicate event - already processed"
                );
                return Ok(ProcessOutcome::AlreadyProcessed);
            }
            EventStatus::Processing => {
                tracing::info!(
                    event_id = %id,
                    event_type = %event.event_type,
                    "Duplicate event - currently being processed by another worker"
                );
                return Ok(ProcessOutcome::InFlight);
            }
            EventStatus::Failed if event.attempts >= max_attempts => {
                tracing::info!(
                    event_id = %id,
                    event_type = %event.event_type,
                    attempts = event.attempts,
                    "Event is dead-lettered - not retrying"
                );
                return Ok(ProcessOutcome::DeadLettered {
                    attempts: event.attempts,
                    error: event.error_message.unwrap_or_default(),
                });
            }
            EventStatus::Received | EventStatus::Failed => {}
        }

        if !self.ledger.try_claim(id, max_attempts).await? {
            tracing::info!(
                event_id = %id,
                event_type = %event.event_type,
                "Lost claim race - another worker owns this event"
            );
            return Ok(ProcessOutcome::InFlight);
        }

        let event = Event {
            status: EventStatus::Processing,
            ..event
        };

        tracing::info!(
            event_id = %id,
            event_type = %event.event_type,
            attempt = event.attempts + 1,
            "Processing event (claimed exclusive processing rights)"
        );

        match self.dispatcher.dispatch(&event).await {
            Ok(dispatched) => Ok(self.record_success(&event, dispatched).await),
            Err(err) => Ok(self.record_failure(&event, err).await),
        }
    }

    /// Re-run an event claimed from the retry queue, using its stored payload
    pub async fn process_retry(&self, entry: &RetryEntry) -> PipelineResult<ProcessOutcome> {
        let event = self.ledger.lookup(&entry.event_id).await?.ok_or_else(|| {
            tracing::warn!(
                event_id = %entry.event_id,
                event_type = %entry.event_type,
                "Dropping retry for event missing from the ledger"
            );
            PipelineError::NotFound(format!("Event {} not found in ledger", entry.event_id))
        })?;

        if entry.attempt_number != event.attempts + 1 {
            tracing::debug!(
                event_id = %entry.event_id,
                attempt_number = entry.attempt_number,
                attempts = event.attempts,
                "Retry entry attempt number is behind the ledger"
            );
        }

        self.process(&event.id, &event.event_type, event.payload)
            .await
    }

    async fn record_success(&self, event: &Event, dispatched: DispatchOutcome) -> ProcessOutcome {
        let id = event.id.as_str();
        let ledger = &self.ledger;

        match persist(move || ledger.mark_processed(id)).await {
            Ok(()) => {}
            // A retried write whose first try committed finds the row already processed
            Err(PipelineError::NotFound(_)) => match self.ledger.lookup(id).await {
                Ok(Some(current)) if current.status == EventStatus::Processed => {
                    tracing::debug!(event_id = %id, "Event already marked processed");
                }
                _ => tracing::warn!(
                    event_id = %id,
                    event_type = %event.event_type,
                    "Claim was taken over before the outcome was recorded"
                ),
            },
            Err(e) => tracing::error!(
                event_id = %id,
                event_type = %event.event_type,
                error = %e,
                "CRITICAL: Failed to mark event processed after retry. \
                 Event will stay in 'processing' until the stale-claim sweep recovers it."
            ),
        }

        self.cancel_pending_retry(id).await;

        match dispatched {
            DispatchOutcome::Handled => {
                tracing::info!(
                    event_id = %id,
                    event_type = %event.event_type,
                    attempt = event.attempts + 1,
                    "Event processed"
                );
                ProcessOutcome::Processed
            }
            DispatchOutcome::Unhandled => ProcessOutcome::Ignored,
        }
    }

    /// Record a failed attempt for an event currently in `processing` and decide
    /// between retrying and dead-lettering
    async fn record_failure(&self, event: &Event, err: HandlerError) -> ProcessOutcome {
        let id = event.id.as_str();
        let message = err.to_string();
        let msg = message.as_str();
        let ledger = &self.ledger;

        if !err.is_retryable() {
            let max_attempts = self.policy().max_attempts;
            let attempts =
                match persist(move || ledger.mark_dead_lettered(id, msg, max_attempts)).await {
                    Ok(attempts) => attempts,
                    Err(e) => {
                        self.log_bookkeeping_failure(event, &message, &e);
                        return ProcessOutcome::RetryDeferred {
                            attempts: event.attempts + 1,
                        };
                    }
                };
            self.cancel_pending_retry(id).await;
            emit_dead_letter(event, attempts, &message);
            return ProcessOutcome::DeadLettered {
                attempts,
                error: message,
            };
        }

        match persist(move || ledger.mark_failed(id, msg)).await {
            Ok(attempts) => self.retry_or_dead_letter(event, attempts, message).await,
            Err(e) => {
                self.log_bookkeeping_failure(event, &message, &e);
                ProcessOutcome::RetryDeferred {
                    attempts: event.attempts + 1,
                }
            }
        }
    }

    /// Take over a claim abandoned since before `claimed_before` and record it as a
    /// failed attempt. `None` means the claim finished or was re-taken in the meantime.
    pub(crate) async fn recover_stale_claim(
        &self,
        event: &Event,
        claimed_before: OffsetDateTime,
        message: &str,
    ) -> PipelineResult<Option<ProcessOutcome>> {
        let Some(attempts) = self
            .ledger
            .fail_stale_claim(&event.id, claimed_before, message)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(
            self.retry_or_dead_letter(event, attempts, message.to_string())
                .await,
        ))
    }

    /// After a failure has been recorded with `attempts` total, queue the next
    /// attempt or dead-letter the event
    async fn retry_or_dead_letter(
        &self,
        event: &Event,
        attempts: u32,
        message: String,
    ) -> ProcessOutcome {
        let id = event.id.as_str();

        if !self.policy().has_attempts_left(attempts) {
            self.cancel_pending_retry(id).await;
            emit_dead_letter(event, attempts, &message);
            return ProcessOutcome::DeadLettered {
                attempts,
                error: message,
            };
        }

        match self
            .scheduler
            .schedule_retry(id, &event.event_type, attempts)
            .await
        {
            Ok(entry) => ProcessOutcome::RetryScheduled {
                attempts,
                retry_at: entry.retry_at,
            },
            Err(e) => {
                // No in-process fallback timer: the reconciliation sweep picks up
                // failed rows that have no queue entry
                tracing::warn!(
                    event_id = %id,
                    event_type = %event.event_type,
                    attempts = attempts,
                    error = %e,
                    "Failed to queue retry - deferring to reconciliation sweep"
                );
                ProcessOutcome::RetryDeferred { attempts }
            }
        }
    }

    async fn cancel_pending_retry(&self, id: &str) {
        match self.queue.cancel(id).await {
            Ok(true) => tracing::debug!(event_id = %id, "Cancelled pending retry"),
            Ok(false) => {}
            Err(e) => tracing::warn!(
                event_id = %id,
                error = %e,
                "Failed to cancel pending retry"
            ),
        }
    }

    fn log_bookkeeping_failure(&self, event: &Event, handler_error: &str, e: &PipelineError) {
        tracing::error!(
            event_id = %event.id,
            event_type = %event.event_type,
            handler_error = %handler_error,
            error = %e,
            "CRITICAL: Failed to record event failure after retry. \
             Event may appear stuck in 'processing' state until the stale-claim sweep recovers it."
        );
    }
}

/// Run a ledger write, retrying briefly while the error looks transient
async fn persist<T, F, Fut>(op: F) -> PipelineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let strategy = ExponentialBackoff::from_millis(BOOKKEEPING_RETRY_BASE_MS)
        .max_delay(Duration::from_millis(500))
        .take(BOOKKEEPING_RETRIES);
    RetryIf::start(strategy, op, |e: &PipelineError| e.is_transient()).await
}

/// Terminal-failure signal for alerting
fn emit_dead_letter(event: &Event, attempts: u32, error: &str) {
    tracing::error!(
        alert = "dead_letter",
        event_id = %event.id,
        event_type = %event.event_type,
        attempts = attempts,
        error = %error,
        "Event permanently failed - manual intervention required"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::InMemoryEventLedger;
    use crate::registry::{handler_fn, HandlerRegistry};
    use crate::retry_queue::InMemoryRetryQueue;
    use serde_json::json;

    struct Harness {
        ingress: EventIngress,
        ledger: Arc<InMemoryEventLedger>,
        queue: Arc<InMemoryRetryQueue>,
    }

    fn harness(registry: HandlerRegistry) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let ledger = Arc::new(InMemoryEventLedger::new(clock.clone()));
        let queue = Arc::new(InMemoryRetryQueue::new());
        let scheduler = RetryScheduler::new(queue.clone(), RetryPolicy::default(), clock);
        let ingress = EventIngress::new(
            ledger.clone(),
            queue.clone(),
            Dispatcher::new(Arc::new(registry)),
            scheduler,
        );
        Harness {
            ingress,
            ledger,
            queue,
        }
    }

    #[tokio::test]
    async fn test_empty_id_is_rejected() {
        let h = harness(HandlerRegistry::new());
        let err = h.ingress.process("  ", "ping", json!({})).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        let err = h.ingress.process("evt", "", json!({})).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_success_marks_processed_and_clears_stray_retry() {
        let mut registry = HandlerRegistry::new();
        registry.register("invoice.paid", handler_fn(|_| async { Ok(()) }));
        let h = harness(registry);

        h.queue
            .schedule(RetryEntry {
                event_id: "evt_ok".to_string(),
                event_type: "invoice.paid".to_string(),
                attempt_number: 2,
                retry_at: OffsetDateTime::UNIX_EPOCH,
                created_at: OffsetDateTime::UNIX_EPOCH,
            })
            .await
            .unwrap();

        let outcome = h
            .ingress
            .process("evt_ok", "invoice.paid", json!({"invoice": "in_1"}))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);
        assert!(outcome.is_success());

        let event = h.ledger.lookup("evt_ok").await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Processed);
        assert!(event.processed_at.is_some());
        assert_eq!(h.queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_dead_letters_immediately() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "customer.deleted",
            handler_fn(|_| async { Err(HandlerError::permanent("customer never existed")) }),
        );
        let h = harness(registry);

        let outcome = h
            .ingress
            .process("evt_perm", "customer.deleted", json!({}))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::DeadLettered {
                attempts: 3,
                error: "permanent failure: customer never existed".to_string(),
            }
        );
        assert!(!outcome.is_success());
        assert!(outcome.should_ack());
        assert_eq!(h.queue.count().await.unwrap(), 0);

        let event = h.ledger.lookup("evt_perm").await.unwrap().unwrap();
        assert!(event.is_dead_lettered(3));
    }

    #[tokio::test]
    async fn test_dead_lettered_event_is_not_reprocessed() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "charge",
            handler_fn(|_| async { Err(HandlerError::permanent("bad")) }),
        );
        let h = harness(registry);

        h.ingress.process("evt_dl", "charge", json!({})).await.unwrap();
        let again = h.ingress.process("evt_dl", "charge", json!({})).await.unwrap();
        assert!(matches!(again, ProcessOutcome::DeadLettered { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_retry_for_missing_event_is_not_found() {
        let h = harness(HandlerRegistry::new());
        let entry = RetryEntry {
            event_id: "ghost".to_string(),
            event_type: "charge".to_string(),
            attempt_number: 2,
            retry_at: OffsetDateTime::UNIX_EPOCH,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        assert!(matches!(
            h.ingress.process_retry(&entry).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let value = serde_json::to_value(ProcessOutcome::RetryDeferred { attempts: 2 }).unwrap();
        assert_eq!(value, json!({"outcome": "retry_deferred", "attempts": 2}));
    }
}
