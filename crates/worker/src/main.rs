//! Eventgate Background Worker
//!
//! Runs the retry side of the event pipeline:
//! - Retry queue polling (continuous, `RETRY_POLL_INTERVAL_MS`)
//! - Reconciliation of stale claims, unclaimed events and orphaned failures (every minute)
//! - Pipeline stats snapshot (every 5 minutes)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;

use eventgate_pipeline::{forwarding_registry, Pipeline, PipelineSettings};
use eventgate_shared::{create_migration_pool, create_pool, run_migrations, Config};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Eventgate Worker");

    let config = Config::from_env()?;

    if config.run_migrations {
        let migration_pool = create_migration_pool(&config.database_url).await?;
        run_migrations(&migration_pool).await?;
        migration_pool.close().await;
    }

    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    info!("Database pool created");

    let registry = forwarding_registry(&config, reqwest::Client::new());
    if registry.is_empty() {
        info!("No forwarding routes configured - every event type will be acknowledged and ignored");
    }

    let settings = PipelineSettings::from_config(&config);
    let pipeline = Pipeline::postgres(pool, registry, settings);

    // Retry worker runs until shutdown
    let shutdown = CancellationToken::new();
    let retry_worker = pipeline.retry_worker.clone();
    let worker_shutdown = shutdown.clone();
    let retry_handle = tokio::spawn(async move { retry_worker.run(worker_shutdown).await });

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Reconciliation sweep (every minute)
    let reconciler = Arc::clone(&pipeline.reconciler);
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let reconciler = reconciler.clone();
            Box::pin(async move {
                if let Err(e) = reconciler.sweep().await {
                    error!(error = %e, "Reconciliation sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Reconciliation sweep (every minute)");

    // Job 2: Pipeline stats (every 5 minutes)
    let metrics = pipeline.metrics.clone();
    let window = config.metrics_window;
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let metrics = metrics.clone();
            Box::pin(async move {
                metrics.log_snapshot(window).await;
            })
        })?)
        .await?;
    info!("Scheduled: Pipeline stats (every 5 minutes)");

    // Job 3: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("30 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Eventgate Worker started successfully with {} scheduled jobs", 3);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    if let Err(e) = scheduler.shutdown().await {
        error!(error = %e, "Failed to stop job scheduler");
    }
    if let Err(e) = retry_handle.await {
        error!(error = %e, "Retry worker task failed");
    }

    info!("Eventgate Worker stopped");
    Ok(())
}
