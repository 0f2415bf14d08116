//! Shared harness: in-memory billing, fake Stripe, stub answer engine

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use lexfam_api::answer::{AnswerEngine, AnswerError, ChatTurn};
use lexfam_api::{create_router, AppState, Config};
use lexfam_billing::testing::{sample_subscription, FakeGateway};
use lexfam_billing::{
    BillingService, BillingSettings, BillingStores, MemoryStore, PriceIds, SubscriptionStore,
};
use lexfam_shared::Role;
use serde_json::Value;
use tower::ServiceExt;

pub const MONTHLY: &str = "price_sample_monthly";
pub const YEARLY: &str = "price_sample_yearly";
pub const WEBHOOK_SECRET: &str = "whsec_api_tests";
pub const LIMIT: i64 = 20;

/// Answer engine that echoes the question, or fails on demand
#[derive(Default)]
pub struct StubAnswerEngine {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl AnswerEngine for StubAnswerEngine {
    async fn answer(&self, question: &str, _history: &[ChatTurn]) -> Result<String, AnswerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AnswerError::Status {
                status: 503,
                body: "retriever down".to_string(),
            });
        }
        Ok(format!("answer to: {question}"))
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub engine: Arc<StubAnswerEngine>,
}

pub fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        database_url: "postgres://unused".to_string(),
        database_max_connections: 1,
        run_migrations: false,
        jwt_secret: "api-tests-jwt-secret-at-least-32-characters".to_string(),
        jwt_expiry_hours: 1,
        free_user_message_limit: LIMIT,
        cors_allowed_origins: vec!["http://localhost:3000".to_string()],
        answer_engine_url: "http://localhost:0/answer".to_string(),
        answer_engine_timeout: Duration::from_secs(1),
        log_json: false,
    }
}

impl TestApp {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::with_sample_catalog());
        let gateway = Arc::new(FakeGateway::new());
        let engine = Arc::new(StubAnswerEngine::default());

        let billing = BillingService::new(
            BillingStores::memory(store.clone()),
            gateway.clone(),
            BillingSettings {
                price_ids: PriceIds {
                    monthly: MONTHLY.to_string(),
                    yearly: YEARLY.to_string(),
                },
                webhook_secret: Some(WEBHOOK_SECRET.to_string()),
                app_base_url: "http://localhost:3000".to_string(),
            },
        );

        let state = AppState::new(test_config(), billing, engine.clone());
        Self {
            router: create_router(state.clone()),
            state,
            store,
            gateway,
            engine,
        }
    }

    /// Seed a user and return a bearer token for them
    pub async fn user(&self, identifier: &str, role: Role) -> String {
        self.store.seed_user(identifier, role).await;
        let (token, _) = self
            .state
            .jwt
            .generate_access_token(identifier, role, Some(identifier))
            .unwrap();
        token
    }

    /// Give the user an active monthly subscription on `cus_{n}` / `sub_{n}`
    pub async fn subscribe(&self, identifier: &str, n: u32) -> String {
        let customer_id = format!("cus_{n}");
        let subscription_id = format!("sub_{n}");

        self.store
            .upsert_customer(identifier, &customer_id, Some(identifier), None)
            .await
            .unwrap();
        self.store
            .upsert_subscription(&sample_subscription(&subscription_id, identifier, &customer_id, MONTHLY))
            .await
            .unwrap();
        self.gateway.put_customer(&customer_id).await;
        self.gateway
            .put_subscription(FakeGateway::active_snapshot(&subscription_id, &customer_id, MONTHLY))
            .await;
        subscription_id
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, body)
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> (StatusCode, Value) {
        self.send(request("GET", path, token, None)).await
    }

    pub async fn post(&self, path: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.send(request("POST", path, token, Some(body))).await
    }

    pub async fn put(&self, path: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.send(request("PUT", path, token, Some(body))).await
    }
}

pub fn request(method: &str, path: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}
