//! Scheduled billing jobs
//!
//! Each job is a plain async function over a billing service so the
//! scheduler closures stay thin and the jobs can run against in-memory
//! stores in tests.

use std::env;
use std::time::Duration;

use lexfam_billing::{ReconcileReport, ReplayReport, SubscriptionService, WebhookHandler};
use tracing::{error, info};

/// Only events whose last attempt is at least this old are replayed
pub const REPLAY_MIN_AGE: Duration = Duration::from_secs(5 * 60);

/// Worker schedule, from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Six-field cron expression (seconds first)
    pub webhook_replay_cron: String,
    pub reconcile_cron: String,
    pub webhook_replay_batch: i64,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            webhook_replay_cron: env::var("WEBHOOK_REPLAY_CRON")
                .unwrap_or_else(|_| "0 */10 * * * *".to_string()),
            reconcile_cron: env::var("RECONCILE_CRON").unwrap_or_else(|_| "0 0 * * * *".to_string()),
            webhook_replay_batch: env::var("WEBHOOK_REPLAY_BATCH")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|batch: &i64| *batch > 0)
                .unwrap_or(25),
        }
    }
}

/// Re-run errored webhook events
pub async fn replay_failed_webhooks(
    webhooks: &WebhookHandler,
    min_age: Duration,
    batch: i64,
) -> Option<ReplayReport> {
    match webhooks.replay_failed(min_age, batch).await {
        Ok(report) => {
            if report.replayed + report.failed + report.skipped > 0 {
                info!(
                    replayed = report.replayed,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Webhook replay cycle complete"
                );
            }
            Some(report)
        }
        Err(e) => {
            error!(error = %e, "Failed to list webhook events for replay");
            None
        }
    }
}

/// Pull every current subscription from Stripe
pub async fn reconcile_subscriptions(subscriptions: &SubscriptionService) -> Option<ReconcileReport> {
    match subscriptions.reconcile_all().await {
        Ok(report) => {
            info!(
                synced = report.synced,
                failed = report.failed,
                "Subscription reconciliation complete"
            );
            Some(report)
        }
        Err(e) => {
            error!(error = %e, "Subscription reconciliation failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lexfam_billing::testing::{event_payload, subscription_object, FakeGateway};
    use lexfam_billing::webhooks::WebhookEvent;
    use lexfam_billing::{
        BillingError, BillingService, BillingSettings, BillingStores, MemoryStore, PriceIds,
        PriceSnapshot, SubscriptionStore,
    };
    use lexfam_shared::{BillingInterval, Role, SubscriptionStatus};
    use serial_test::serial;

    const USER: &str = "parent@example.com";

    fn service(store: Arc<MemoryStore>, gateway: Arc<FakeGateway>) -> BillingService {
        BillingService::new(
            BillingStores::memory(store),
            gateway,
            BillingSettings {
                price_ids: PriceIds {
                    monthly: "price_sample_monthly".to_string(),
                    yearly: "price_sample_yearly".to_string(),
                },
                webhook_secret: None,
                app_base_url: "http://localhost:3000".to_string(),
            },
        )
    }

    #[test]
    #[serial]
    fn test_config_defaults_and_overrides() {
        for var in ["WEBHOOK_REPLAY_CRON", "RECONCILE_CRON", "WEBHOOK_REPLAY_BATCH"] {
            env::remove_var(var);
        }
        let config = WorkerConfig::from_env();
        assert_eq!(config.webhook_replay_cron, "0 */10 * * * *");
        assert_eq!(config.reconcile_cron, "0 0 * * * *");
        assert_eq!(config.webhook_replay_batch, 25);

        env::set_var("WEBHOOK_REPLAY_BATCH", "0");
        assert_eq!(WorkerConfig::from_env().webhook_replay_batch, 25);
        env::set_var("WEBHOOK_REPLAY_BATCH", "100");
        assert_eq!(WorkerConfig::from_env().webhook_replay_batch, 100);
        env::remove_var("WEBHOOK_REPLAY_BATCH");
    }

    #[tokio::test]
    async fn test_replay_recovers_failed_event() {
        let store = Arc::new(MemoryStore::with_sample_catalog());
        let gateway = Arc::new(FakeGateway::new());
        let billing = service(store.clone(), gateway.clone());

        store.seed_user(USER, Role::User).await;
        store.upsert_customer(USER, "cus_1", Some(USER), None).await.unwrap();

        let payload = event_payload(
            "evt_1",
            "customer.subscription.created",
            1_700_000_100,
            subscription_object("sub_1", "cus_1", "price_new", "active"),
        );
        let event = WebhookEvent::parse(&payload).unwrap();
        assert!(billing.webhooks.handle_event(&event).await.is_err());

        // Nothing old enough yet
        let report = replay_failed_webhooks(&billing.webhooks, REPLAY_MIN_AGE, 25).await.unwrap();
        assert_eq!(report, ReplayReport::default());

        gateway
            .put_price(PriceSnapshot {
                id: "price_new".to_string(),
                product_id: Some("prod_sample_pro".to_string()),
                product_name: Some("Pro Plan".to_string()),
                unit_amount: Some(3900),
                currency: Some("usd".to_string()),
                interval: Some(BillingInterval::Month),
            })
            .await;

        let report = replay_failed_webhooks(&billing.webhooks, Duration::ZERO, 25).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.failed, 0);

        let record = store.get_subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.user_id, USER);
    }

    #[tokio::test]
    async fn test_reconcile_pulls_remote_status() {
        let store = Arc::new(MemoryStore::with_sample_catalog());
        let gateway = Arc::new(FakeGateway::new());
        let billing = service(store.clone(), gateway.clone());

        store.seed_user(USER, Role::User).await;
        store.upsert_customer(USER, "cus_1", Some(USER), None).await.unwrap();
        store
            .upsert_subscription(&lexfam_billing::testing::sample_subscription(
                "sub_1",
                USER,
                "cus_1",
                "price_sample_monthly",
            ))
            .await
            .unwrap();

        let mut remote = FakeGateway::active_snapshot("sub_1", "cus_1", "price_sample_monthly");
        remote.status = SubscriptionStatus::PastDue;
        gateway.put_subscription(remote).await;

        let report = reconcile_subscriptions(&billing.subscriptions).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 0);

        let record = store.get_subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn test_reconcile_counts_gateway_failures() {
        let store = Arc::new(MemoryStore::with_sample_catalog());
        let gateway = Arc::new(FakeGateway::new());
        let billing = service(store.clone(), gateway.clone());

        store.seed_user(USER, Role::User).await;
        store.upsert_customer(USER, "cus_1", Some(USER), None).await.unwrap();
        store
            .upsert_subscription(&lexfam_billing::testing::sample_subscription(
                "sub_1",
                USER,
                "cus_1",
                "price_sample_monthly",
            ))
            .await
            .unwrap();
        gateway.fail_next(BillingError::GatewayTimeout("retrieve".into())).await;

        let report = reconcile_subscriptions(&billing.subscriptions).await.unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.failed, 1);

        let record = store.get_subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
    }
}
