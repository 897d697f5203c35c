//! Recap Background Worker
//!
//! Runs the webhook job pool and scheduled maintenance:
//! - Webhook job processing (fixed pool of `WORKER_CONCURRENCY` tasks)
//! - Stuck-event sweep (every 5 minutes)
//! - Finished job cleanup (daily at 3:00 AM UTC)

mod config;
mod webhook_processor;

use std::sync::Arc;
use std::time::Duration;

use recap_billing::{
    BillingEmailService, JobProcessor, PgBillingStore, PgJobQueue, Reconciler,
};
use recap_shared::create_pool;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::webhook_processor::WorkerPool;

/// Finished job rows older than this are deleted; the event audit log is kept
const JOB_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

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

    info!("Starting Recap Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = WorkerConfig::from_env()?;
    info!(config = ?config, "Configuration loaded");

    let pool = create_pool(&config.database_url).await?;

    let store = Arc::new(PgBillingStore::new(pool.clone()));
    let queue = Arc::new(PgJobQueue::new(pool));
    let email = Arc::new(BillingEmailService::new(config.email.clone())?);
    let reconciler = Reconciler::new(store.clone(), email);
    let processor = JobProcessor::new(store, queue, reconciler);

    // Recover anything left behind while no worker was running
    match processor
        .requeue_stuck_events(config.stuck_after, config.job_options)
        .await
    {
        Ok(0) => {}
        Ok(count) => warn!(count, "Re-enqueued stuck webhook events at startup"),
        Err(e) => error!(error = %e, "Startup stuck-event sweep failed"),
    }

    // Create scheduler
    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Stuck-event sweep (every 5 minutes)
    let sweep_processor = processor.clone();
    let stuck_after = config.stuck_after;
    let job_options = config.job_options;
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let processor = sweep_processor.clone();
            Box::pin(async move {
                match processor.requeue_stuck_events(stuck_after, job_options).await {
                    Ok(0) => {}
                    Ok(count) => warn!(count, "Re-enqueued stuck webhook events"),
                    Err(e) => error!(error = %e, "Stuck-event sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stuck webhook event sweep (every 5 minutes)");

    // Job 2: Finished job cleanup (daily at 3:00 AM UTC)
    let purge_processor = processor.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let processor = purge_processor.clone();
            Box::pin(async move {
                match processor.purge_finished_jobs(JOB_RETENTION).await {
                    Ok(deleted) => info!(deleted, "Purged finished webhook jobs"),
                    Err(e) => error!(error = %e, "Webhook job purge failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Finished job cleanup (daily at 3:00 AM UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = WorkerPool::new(
        processor,
        config.concurrency,
        config.poll_interval,
        config.lease,
    );
    let handles = workers.spawn(shutdown_rx);
    info!(
        concurrency = config.concurrency,
        "Recap Worker started successfully"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, waiting for in-flight jobs");

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.shutdown().await {
        warn!(error = %e, "Scheduler shutdown failed");
    }
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task panicked");
        }
    }

    info!("Recap Worker stopped");
    Ok(())
}
