//! Postgres store behaviour that the in-memory store cannot prove
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/lexfam_test"
//! cargo test -p lexfam-billing --test postgres_store -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use lexfam_billing::subscriptions::{NewSubscription, PriceRecord, WriteOutcome};
use lexfam_billing::users::{NewUser, UserStore};
use lexfam_billing::webhooks::{ClaimResult, ProcessingResult, STALE_PROCESSING_AFTER};
use lexfam_billing::{PgBillingStore, SubscriptionStore, UsageStore, WebhookEvent, WebhookEventStore};
use lexfam_shared::{BillingInterval, Provider, Role, SubscriptionStatus};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

async fn setup() -> Arc<PgBillingStore> {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let pool = lexfam_shared::create_pool(&url, 10)
        .await
        .expect("Failed to create pool");
    lexfam_shared::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(PgBillingStore::new(pool))
}

async fn new_user(store: &PgBillingStore) -> String {
    let identifier = format!("{}@example.com", Uuid::new_v4());
    store
        .create_user(&NewUser {
            identifier: identifier.clone(),
            email: Some(identifier.clone()),
            display_name: None,
            password_hash: None,
            role: Role::User,
            provider: Provider::Password,
        })
        .await
        .unwrap();
    identifier
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_increments_are_not_lost() {
    let store = setup().await;
    let user = new_user(&store).await;

    let mut handles = Vec::new();
    for _ in 0..25 {
        let store = store.clone();
        let user = user.clone();
        handles.push(tokio::spawn(async move { store.increment(&user).await.unwrap() }));
    }

    let mut seen = Vec::new();
    for handle in handles {
        seen.push(handle.await.unwrap());
    }
    seen.sort_unstable();

    assert_eq!(seen, (1..=25).collect::<Vec<i64>>());
    assert_eq!(store.get_count(&user).await.unwrap(), 25);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_unknown_user_counter_is_noop() {
    let store = setup().await;
    let ghost = format!("{}@example.com", Uuid::new_v4());

    assert_eq!(store.increment(&ghost).await.unwrap(), 0);
    assert_eq!(store.get_count(&ghost).await.unwrap(), 0);
    assert!(!store.reset(&ghost).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires database
async fn test_upsert_single_row_with_event_ordering() {
    let store = setup().await;
    let user = new_user(&store).await;
    let suffix = Uuid::new_v4().simple().to_string();
    let customer_id = format!("cus_{suffix}");
    let price_id = format!("price_{suffix}");
    let subscription_id = format!("sub_{suffix}");

    store
        .insert_price(&PriceRecord {
            price_id: price_id.clone(),
            product_id: format!("prod_{suffix}"),
            product_name: "Pro Plan".to_string(),
            unit_amount: 3900,
            currency: "usd".to_string(),
            interval: BillingInterval::Month,
        })
        .await
        .unwrap();
    store
        .upsert_customer(&user, &customer_id, Some(&user), None)
        .await
        .unwrap();

    let observed_at = OffsetDateTime::now_utc();
    let mut row = NewSubscription {
        subscription_id: subscription_id.clone(),
        user_id: user.clone(),
        customer_id,
        price_id,
        status: SubscriptionStatus::Active,
        plan_name: "Pro".to_string(),
        billing_cycle: Some(BillingInterval::Month),
        current_period_start: Some(observed_at),
        current_period_end: Some(observed_at + time::Duration::days(30)),
        cancel_at_period_end: false,
        observed_at,
    };
    assert_eq!(store.upsert_subscription(&row).await.unwrap(), WriteOutcome::Applied);

    // An older observation must not roll the row back
    row.status = SubscriptionStatus::Incomplete;
    row.observed_at = observed_at - time::Duration::minutes(5);
    assert_eq!(store.upsert_subscription(&row).await.unwrap(), WriteOutcome::Stale);

    row.status = SubscriptionStatus::PastDue;
    row.observed_at = observed_at + time::Duration::minutes(5);
    assert_eq!(store.upsert_subscription(&row).await.unwrap(), WriteOutcome::Applied);

    let current = store.get_current_subscription(&user).await.unwrap().unwrap();
    assert_eq!(current.subscription_id, subscription_id);
    assert_eq!(current.status, SubscriptionStatus::PastDue);
    assert_eq!(current.unit_amount, Some(3900));
}

#[tokio::test]
#[ignore] // Requires database
async fn test_event_claimed_once() {
    let store = setup().await;
    let event_id = format!("evt_{}", Uuid::new_v4().simple());
    let event = WebhookEvent::from_value(json!({
        "id": event_id,
        "object": "event",
        "type": "charge.refunded",
        "created": 1_700_000_000,
        "data": { "object": { "id": "ch_1" } }
    }))
    .unwrap();

    let (first, second) = tokio::join!(
        store.claim_event(&event, STALE_PROCESSING_AFTER),
        store.claim_event(&event, STALE_PROCESSING_AFTER),
    );
    let claims = [first.unwrap(), second.unwrap()];
    assert_eq!(claims.iter().filter(|c| **c == ClaimResult::Claimed).count(), 1);

    store
        .finish_event(&event.id, ProcessingResult::Error, Some("boom"))
        .await
        .unwrap();
    // Errored events can be taken over
    assert_eq!(
        store.claim_event(&event, STALE_PROCESSING_AFTER).await.unwrap(),
        ClaimResult::Claimed
    );

    store
        .finish_event(&event.id, ProcessingResult::Success, None)
        .await
        .unwrap();
    assert_eq!(
        store.claim_event(&event, STALE_PROCESSING_AFTER).await.unwrap(),
        ClaimResult::AlreadyProcessed(ProcessingResult::Success)
    );

    let stored = store.get_event(&event.id).await.unwrap().unwrap();
    assert_eq!(stored.result, ProcessingResult::Success);
    assert_eq!(stored.attempts, 2);
}
