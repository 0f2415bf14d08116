//! API routes

pub mod admin;
pub mod auth;
pub mod chat;
pub mod health;
pub mod subscription;
pub mod usage;
pub mod webhook;

use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    auth::{require_admin, require_auth},
    state::AppState,
};

/// Prefix shared with the chat front end
pub const API_PREFIX: &str = "/chat/api";

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let public_routes = Router::new()
        .route("/auth/signup", post(auth::signup))
        .route("/auth/login", post(auth::login))
        .route("/subscription/plans", get(subscription::plans))
        .route("/stripe/webhook", post(webhook::stripe_webhook));

    let protected_routes = Router::new()
        .route("/auth/me", get(auth::me))
        .route(
            "/subscription/create-checkout-session",
            post(subscription::create_checkout_session),
        )
        .route("/subscription/status", get(subscription::status))
        .route("/subscription/cancel", post(subscription::cancel))
        .route("/subscription/customer-portal", post(subscription::customer_portal))
        .route("/subscription/billing-history", get(subscription::billing_history))
        .route("/subscription/modify", post(subscription::modify))
        .route("/subscription/sync", post(subscription::sync))
        .route(
            "/subscription/reset-message-count",
            post(subscription::reset_message_count),
        )
        .route("/usage/status", get(usage::status))
        .route("/chat/messages", post(chat::send_message));

    let admin_routes = Router::new()
        .route("/admin/users", get(admin::list_users))
        .route("/admin/users/:user_id/role", put(admin::update_user_role))
        .route("/admin/users/:user_id/subscription", get(admin::user_subscription))
        .route("/admin/users/:user_id/billing", get(admin::user_billing))
        .route("/admin/subscriptions", get(admin::list_subscriptions))
        .route(
            "/admin/subscriptions/:subscription_id/cancel",
            post(admin::cancel_subscription),
        )
        .route("/admin/billing/global", get(admin::global_billing))
        .route("/admin/webhooks/failed", get(admin::failed_webhooks))
        .route("/admin/webhooks/:event_id/replay", post(admin::replay_webhook))
        .layer(middleware::from_fn(require_admin));

    // Layers run outside-in: require_auth wraps require_admin
    let authenticated = protected_routes
        .merge(admin_routes)
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let api = public_routes.merge(authenticated);

    Router::new()
        .merge(health_routes)
        .nest(API_PREFIX, api)
        .layer(cors_layer(&state.config.cors_allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}
