//! Gated chat path and usage status

mod common;

use std::sync::atomic::Ordering;

use axum::http::StatusCode;
use common::{TestApp, LIMIT};
use lexfam_billing::UsageStore;
use lexfam_shared::Role;
use serde_json::json;

const USER: &str = "parent@example.com";

#[tokio::test]
async fn test_free_user_lifecycle_to_limit() {
    let app = TestApp::new();
    let token = app.user(USER, Role::User).await;

    let (status, body) = app.get("/chat/api/usage/status", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"messageCount": 0, "limit": LIMIT, "canSend": true, "remaining": 20}));

    for sent in 1..=LIMIT {
        let (status, body) = app
            .post("/chat/api/chat/messages", Some(&token), json!({"message": "Who gets the house?"}))
            .await;
        assert_eq!(status, StatusCode::OK, "message {sent}");
        assert_eq!(body["answer"], "answer to: Who gets the house?");
        assert_eq!(body["usage"]["messageCount"], sent);
        assert_eq!(body["usage"]["remaining"], LIMIT - sent);

        // ceil(20 * 0.75) = 15
        if sent >= 15 {
            assert_eq!(body["usage"]["warning"]["remaining"], LIMIT - sent);
        } else {
            assert!(body["usage"].get("warning").is_none(), "message {sent}");
        }
    }

    let (status, body) = app.get("/chat/api/usage/status", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["canSend"], false);
    assert_eq!(body["remaining"], 0);

    let (status, body) = app
        .post("/chat/api/chat/messages", Some(&token), json!({"message": "one more"}))
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "USAGE_LIMIT_EXCEEDED");

    // Blocked requests never reach the engine or the counter
    assert_eq!(app.engine.calls.load(Ordering::SeqCst), LIMIT as usize);
    assert_eq!(app.store.get_count(USER).await.unwrap(), LIMIT);
}

#[tokio::test]
async fn test_engine_failure_does_not_count() {
    let app = TestApp::new();
    let token = app.user(USER, Role::User).await;
    app.engine.fail.store(true, Ordering::SeqCst);

    let (status, body) = app
        .post("/chat/api/chat/messages", Some(&token), json!({"message": "hello"}))
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "ANSWER_ENGINE_ERROR");
    assert_eq!(app.store.get_count(USER).await.unwrap(), 0);
}

#[tokio::test]
async fn test_empty_message_rejected() {
    let app = TestApp::new();
    let token = app.user(USER, Role::User).await;

    let (status, _) = app
        .post("/chat/api/chat/messages", Some(&token), json!({"message": "   "}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.engine.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_paid_and_admin_users_are_not_counted() {
    let app = TestApp::new();
    let paid = app.user(USER, Role::User).await;
    app.subscribe(USER, 1).await;
    let admin = app.user("admin@example.com", Role::Admin).await;

    for token in [&paid, &admin] {
        let (status, body) = app
            .post(
                "/chat/api/chat/messages",
                Some(token),
                json!({"message": "q", "history": [{"role": "user", "content": "earlier"}]}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["usage"]["messageCount"], 0);
        assert!(body["usage"]["remaining"].is_null());
    }

    assert_eq!(app.store.get_count(USER).await.unwrap(), 0);
    assert_eq!(app.store.get_count("admin@example.com").await.unwrap(), 0);
}

#[tokio::test]
async fn test_paid_user_over_old_count_can_send() {
    let app = TestApp::new();
    let token = app.user(USER, Role::User).await;
    for _ in 0..25 {
        app.store.increment(USER).await.unwrap();
    }
    app.subscribe(USER, 1).await;

    let (status, body) = app.get("/chat/api/usage/status", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["canSend"], true);
    assert_eq!(body["messageCount"], 25);
    assert_eq!(body["remaining"], 0);
}

#[tokio::test]
async fn test_zero_limit_blocks_free_users() {
    let mut config = common::test_config();
    config.free_user_message_limit = 0;
    let app = TestApp::new();
    let state = lexfam_api::AppState::new(config, app.state.billing.clone(), app.engine.clone());
    let router = lexfam_api::create_router(state.clone());
    app.store.seed_user(USER, Role::User).await;
    let (token, _) = state.jwt.generate_access_token(USER, Role::User, None).unwrap();

    let response = tower::ServiceExt::oneshot(
        router,
        common::request("POST", "/chat/api/chat/messages", Some(&token), Some(json!({"message": "hi"}))),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
}
