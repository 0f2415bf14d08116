#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Lexfam Background Worker
//!
//! Handles scheduled billing jobs:
//! - Replay of webhook events that failed processing (every 10 minutes)
//! - Reconciliation of current subscriptions against Stripe (hourly)
//! - Heartbeat (every 5 minutes)

mod jobs;

use std::time::Duration;

use lexfam_billing::BillingService;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::jobs::{reconcile_subscriptions, replay_failed_webhooks, WorkerConfig, REPLAY_MIN_AGE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Lexfam Worker");

    let config = WorkerConfig::from_env();
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    let pool = lexfam_shared::create_pool(&database_url, max_connections).await?;
    info!("Database pool created");

    let billing = match BillingService::from_env(pool) {
        Ok(billing) => billing,
        Err(e) => {
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    let webhooks = billing.webhooks.clone();
    let batch = config.webhook_replay_batch;
    scheduler
        .add(Job::new_async(config.webhook_replay_cron.as_str(), move |_uuid, _l| {
            let webhooks = webhooks.clone();
            Box::pin(async move {
                replay_failed_webhooks(&webhooks, REPLAY_MIN_AGE, batch).await;
            })
        })?)
        .await?;
    info!(cron = %config.webhook_replay_cron, batch, "Scheduled: Webhook replay");

    let subscriptions = billing.subscriptions.clone();
    scheduler
        .add(Job::new_async(config.reconcile_cron.as_str(), move |_uuid, _l| {
            let subscriptions = subscriptions.clone();
            Box::pin(async move {
                info!("Running subscription reconciliation");
                reconcile_subscriptions(&subscriptions).await;
            })
        })?)
        .await?;
    info!(cron = %config.reconcile_cron, "Scheduled: Subscription reconciliation");

    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Lexfam Worker started with 3 scheduled jobs");

    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
