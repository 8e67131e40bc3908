// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Eventgate Pipeline
//!
//! Idempotent processing of events from an at-least-once upstream provider.
//!
//! ## Flow
//!
//! inbound event -> [`EventIngress`] (idempotency check + claim) -> [`Dispatcher`]
//! -> handler -> ledger records processed/failed -> [`RetryScheduler`] ->
//! retry queue -> [`RetryWorker`] -> [`EventIngress`] again.
//!
//! ## Features
//!
//! - **Event ledger**: one row per upstream event id, with an atomic claim
//! - **Retry queue**: at most one pending retry per event, exponential backoff
//! - **Handler registry**: event type -> handler, populated at startup
//! - **Reconciliation**: recovers abandoned claims, unclaimed deliveries and failures with no queued retry
//! - **Metrics**: seen/processed/dead-lettered/queued counts over a window
//! - **Forwarding**: ready-made handler that relays events to an HTTP endpoint

pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod forwarding;
pub mod ingress;
pub mod ledger;
pub mod metrics;
pub mod reconcile;
pub mod registry;
pub mod retry_queue;
pub mod retry_worker;
pub mod scheduler;


// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Dispatcher
pub use dispatcher::{DispatchOutcome, Dispatcher};

// Error
pub use error::{HandlerError, PipelineError, PipelineResult};

// Records
pub use event::{Event, EventStatus, LedgerStats, RetryEntry};

// Forwarding
pub use forwarding::{sign_payload, ForwardingHandler};

// Ingress
pub use ingress::{EventIngress, ProcessOutcome};

// Ledger
pub use ledger::{EventLedger, InMemoryEventLedger, PgEventLedger};

// Metrics
pub use metrics::{PipelineMetrics, PipelineStats};

// Reconciliation
pub use reconcile::{
    ReconcileConfig, ReconcileReport, Reconciler, DEFAULT_PROCESSING_TIMEOUT,
    DEFAULT_RECEIVED_GRACE,
};

// Registry
pub use registry::{handler_fn, EventHandler, FnHandler, HandlerRegistry};

// Retry queue
pub use retry_queue::{InMemoryRetryQueue, PgRetryQueue, RetryQueue};

// Retry worker
pub use retry_worker::{RetryBatchReport, RetryWorker, RetryWorkerConfig};

// Scheduler
pub use scheduler::{RetryPolicy, RetryScheduler, DEFAULT_MAX_ATTEMPTS};

use std::sync::Arc;

use eventgate_shared::Config;
use sqlx::PgPool;

/// Tunables for a [`Pipeline`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSettings {
    pub policy: RetryPolicy,
    pub worker: RetryWorkerConfig,
    pub reconcile: ReconcileConfig,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: RetryPolicy {
                max_attempts: config.max_attempts,
                base_delay: config.retry_base_delay,
                max_delay: config.retry_max_delay,
            },
            worker: RetryWorkerConfig {
                poll_interval: config.retry_poll_interval,
                batch_size: config.retry_batch_size,
                concurrency: config.retry_concurrency,
            },
            reconcile: ReconcileConfig {
                processing_timeout: config.processing_timeout,
                received_grace: config.received_grace,
                ..ReconcileConfig::default()
            },
        }
    }
}

/// Build the forwarding handlers described by `config.forward_routes`
pub fn forwarding_registry(config: &Config, client: reqwest::Client) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for route in &config.forward_routes {
        let mut handler = ForwardingHandler::new(client.clone(), route.url.clone())
            .with_timeout(config.forward_timeout);
        if let Some(secret) = &config.forward_signing_secret {
            handler = handler.with_signing_secret(secret.clone());
        }
        registry.register(route.event_type.clone(), handler);
        tracing::info!(
            event_type = %route.event_type,
            url = %route.url,
            "Registered forwarding handler"
        );
    }
    registry
}

/// The assembled pipeline: every component wired to one ledger, one queue and one clock
pub struct Pipeline {
    pub ingress: Arc<EventIngress>,
    pub retry_worker: Arc<RetryWorker>,
    pub reconciler: Arc<Reconciler>,
    pub metrics: PipelineMetrics,
    pub ledger: Arc<dyn EventLedger>,
    pub queue: Arc<dyn RetryQueue>,
}

impl Pipeline {
    pub fn new(
        ledger: Arc<dyn EventLedger>,
        queue: Arc<dyn RetryQueue>,
        registry: HandlerRegistry,
        settings: PipelineSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = RetryScheduler::new(queue.clone(), settings.policy, clock.clone());
        let ingress = Arc::new(EventIngress::new(
            ledger.clone(),
            queue.clone(),
            Dispatcher::new(Arc::new(registry)),
            scheduler.clone(),
        ));
        let retry_worker = Arc::new(RetryWorker::new(
            ingress.clone(),
            queue.clone(),
            clock.clone(),
            settings.worker,
        ));
        let reconciler = Arc::new(Reconciler::new(
            ingress.clone(),
            ledger.clone(),
            queue.clone(),
            scheduler,
            clock.clone(),
            settings.reconcile,
        ));
        let metrics = PipelineMetrics::new(
            ledger.clone(),
            queue.clone(),
            clock,
            settings.policy.max_attempts,
        );

        Self {
            ingress,
            retry_worker,
            reconciler,
            metrics,
            ledger,
            queue,
        }
    }

    /// Postgres-backed pipeline on the wall clock
    pub fn postgres(pool: PgPool, registry: HandlerRegistry, settings: PipelineSettings) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::new(
            Arc::new(PgEventLedger::new(pool.clone(), clock.clone())),
            Arc::new(PgRetryQueue::new(pool)),
            registry,
            settings,
            clock,
        )
    }

    /// In-memory pipeline for tests and local development
    pub fn in_memory(
        registry: HandlerRegistry,
        settings: PipelineSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            Arc::new(InMemoryEventLedger::new(clock.clone())),
            Arc::new(InMemoryRetryQueue::new()),
            registry,
            settings,
            clock,
        )
    }
}
