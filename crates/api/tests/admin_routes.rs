//! Admin console routes

mod common;

use axum::http::StatusCode;
use common::{TestApp, WEBHOOK_SECRET};
use lexfam_billing::testing::{event_payload, invoice_object, subscription_object};
use lexfam_billing::webhooks::signature_header;
use lexfam_billing::{PriceSnapshot, SubscriptionStore};
use lexfam_shared::{BillingInterval, Role, SubscriptionStatus};
use serde_json::json;
use time::OffsetDateTime;

const ADMIN: &str = "admin@example.com";
const USER: &str = "parent@example.com";

async fn deliver(app: &TestApp, payload: &str) -> StatusCode {
    let signature =
        signature_header(payload, WEBHOOK_SECRET, OffsetDateTime::now_utc().unix_timestamp()).unwrap();
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/chat/api/stripe/webhook")
        .header("stripe-signature", signature)
        .body(axum::body::Body::from(payload.to_string()))
        .unwrap();
    app.send(request).await.0
}

#[tokio::test]
async fn test_non_admin_is_forbidden() {
    let app = TestApp::new();
    let token = app.user(USER, Role::User).await;

    for path in [
        "/chat/api/admin/users",
        "/chat/api/admin/subscriptions",
        "/chat/api/admin/billing/global",
        "/chat/api/admin/webhooks/failed",
    ] {
        let (status, body) = app.get(path, Some(&token)).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{path}");
        assert_eq!(body["error"]["code"], "FORBIDDEN");
    }

    let (status, _) = app.get("/chat/api/admin/users", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_check_uses_stored_role() {
    let app = TestApp::new();
    // Token claims ADMIN but the stored role is USER
    app.store.seed_user(USER, Role::User).await;
    let (token, _) = app
        .state
        .jwt
        .generate_access_token(USER, Role::Admin, None)
        .unwrap();

    let (status, _) = app.get("/chat/api/admin/users", Some(&token)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_list_users_and_update_role() {
    let app = TestApp::new();
    let admin = app.user(ADMIN, Role::Admin).await;
    app.user(USER, Role::User).await;
    app.subscribe(USER, 1).await;

    let (status, body) = app.get("/chat/api/admin/users?page=1&limit=10", Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["page"], 1);
    assert_eq!(body["limit"], 10);
    let users = body["users"].as_array().unwrap();
    let parent = users.iter().find(|u| u["identifier"] == USER).unwrap();
    assert_eq!(parent["subscription_status"], "active");
    assert_eq!(parent["role"], "USER");

    let (status, body) = app
        .put(&format!("/chat/api/admin/users/{USER}/role"), Some(&admin), json!({"role": "admin"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "ADMIN");

    let (status, _) = app
        .put(&format!("/chat/api/admin/users/{USER}/role"), Some(&admin), json!({"role": "owner"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .put("/chat/api/admin/users/nobody@example.com/role", Some(&admin), json!({"role": "USER"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_subscriptions_and_cancel() {
    let app = TestApp::new();
    let admin = app.user(ADMIN, Role::Admin).await;
    app.user(USER, Role::User).await;
    let subscription_id = app.subscribe(USER, 1).await;

    let (status, body) = app.get("/chat/api/admin/subscriptions", Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);
    let subscriptions = body["subscriptions"].as_array().unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0]["id"], subscription_id.as_str());
    assert_eq!(subscriptions[0]["user_email"], USER);
    assert_eq!(subscriptions[0]["amount_cents"], 3900);
    assert_eq!(subscriptions[0]["billing_cycle"], "month");

    let (status, body) = app
        .get(&format!("/chat/api/admin/users/{USER}/subscription"), Some(&admin))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscription"]["status"], "active");

    let (status, _) = app
        .post(
            &format!("/chat/api/admin/subscriptions/{subscription_id}/cancel?cancel_immediately=true"),
            Some(&admin),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let record = app.store.get_subscription(&subscription_id).await.unwrap().unwrap();
    assert_eq!(record.status, SubscriptionStatus::Canceled);

    let (status, body) = app
        .get(&format!("/chat/api/admin/users/{USER}/subscription"), Some(&admin))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["subscription"].is_null());

    let (status, _) = app
        .post("/chat/api/admin/subscriptions/sub_missing/cancel", Some(&admin), json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_billing_views() {
    let app = TestApp::new();
    let admin = app.user(ADMIN, Role::Admin).await;
    app.user(USER, Role::User).await;
    app.subscribe(USER, 1).await;

    let payload = event_payload(
        "evt_inv",
        "invoice.payment_succeeded",
        1_700_000_200,
        invoice_object("in_1", "cus_1", Some("sub_1"), 3900),
    );
    assert_eq!(deliver(&app, &payload).await, StatusCode::OK);

    let (status, body) = app.get("/chat/api/admin/billing/global", Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);
    let history = body["billing_history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["invoice_id"], "in_1");
    assert_eq!(history[0]["user_email"], USER);
    assert_eq!(history[0]["amount_paid"], 3900);

    let (status, body) = app
        .get(&format!("/chat/api/admin/users/{USER}/billing?limit=5"), Some(&admin))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["billing_history"].as_array().unwrap().len(), 1);

    let user_token = app.user(USER, Role::User).await;
    let (_, body) = app
        .get("/chat/api/subscription/billing-history", Some(&user_token))
        .await;
    assert_eq!(body["invoices"][0]["id"], "in_1");
    assert_eq!(body["invoices"][0]["amount"], 39.0);
}

#[tokio::test]
async fn test_failed_webhook_replay() {
    let app = TestApp::new();
    let admin = app.user(ADMIN, Role::Admin).await;
    app.user(USER, Role::User).await;
    app.store
        .upsert_customer(USER, "cus_1", Some(USER), None)
        .await
        .unwrap();

    let payload = event_payload(
        "evt_retry",
        "customer.subscription.created",
        1_700_000_100,
        subscription_object("sub_1", "cus_1", "price_late", "active"),
    );
    assert_eq!(deliver(&app, &payload).await, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, body) = app.get("/chat/api/admin/webhooks/failed?limit=10", Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_id"], "evt_retry");
    assert_eq!(events[0]["result"], "error");
    assert_eq!(events[0]["attempts"], 1);

    // The price becomes resolvable, so a replay succeeds
    app.gateway
        .put_price(PriceSnapshot {
            id: "price_late".to_string(),
            product_id: Some("prod_sample_pro".to_string()),
            product_name: Some("Pro Plan".to_string()),
            unit_amount: Some(3900),
            currency: Some("usd".to_string()),
            interval: Some(BillingInterval::Month),
        })
        .await;

    let (status, body) = app
        .post("/chat/api/admin/webhooks/evt_retry/replay", Some(&admin), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "processed");
    assert!(app.store.get_subscription("sub_1").await.unwrap().is_some());

    let (_, body) = app.get("/chat/api/admin/webhooks/failed", Some(&admin)).await;
    assert_eq!(body["events"], json!([]));

    let (status, _) = app
        .post("/chat/api/admin/webhooks/evt_nope/replay", Some(&admin), json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
