//! Subscription routes for Stripe integration

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use lexfam_billing::{
    BillingHistoryEntry, CheckoutParams, CheckoutResponse, ModifyOutcome, Plan, PortalResponse,
    SubscriptionStatusView,
};
use lexfam_shared::SubscriptionStatus;
use serde::{Deserialize, Serialize};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub cancel_immediately: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct PortalRequest {
    pub return_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModifyRequest {
    pub new_price_id: String,
    #[serde(default)]
    pub apply_discount: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct BillingHistoryResponse {
    pub invoices: Vec<BillingHistoryEntry>,
}

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: Vec<Plan>,
}

/// Create a checkout session for a catalog price
pub async fn create_checkout_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CheckoutParams>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let user = state.billing.users.require(&auth_user.user_id).await?;
    let checkout_url = state.billing.checkout.create_session(&user, &req).await?;

    Ok(Json(CheckoutResponse { checkout_url }))
}

/// Current subscription, or the free plan
pub async fn status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<SubscriptionStatusView>, ApiError> {
    let view = state.billing.subscriptions.status(&auth_user.user_id).await?;
    Ok(Json(view))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<MessageResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    state
        .billing
        .subscriptions
        .cancel(&auth_user.user_id, req.cancel_immediately)
        .await?;

    Ok(Json(MessageResponse {
        success: true,
        message: "Subscription cancelled successfully".to_string(),
    }))
}

pub async fn customer_portal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Option<Json<PortalRequest>>,
) -> Result<Json<PortalResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let portal_url = state
        .billing
        .portal
        .create_portal_session(&auth_user.user_id, req.return_url.as_deref())
        .await?;

    Ok(Json(PortalResponse { portal_url }))
}

pub async fn billing_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<BillingHistoryResponse>, ApiError> {
    let invoices = state
        .billing
        .subscriptions
        .billing_history(&auth_user.user_id, query.limit.unwrap_or(20))
        .await?;

    Ok(Json(BillingHistoryResponse { invoices }))
}

/// Public plan catalog
pub async fn plans(State(state): State<AppState>) -> Json<PlansResponse> {
    Json(PlansResponse {
        plans: state.billing.plans(),
    })
}

/// Switch the current subscription to another price with proration
pub async fn modify(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ModifyRequest>,
) -> Result<Json<ModifyOutcome>, ApiError> {
    let outcome = state
        .billing
        .subscriptions
        .modify(&auth_user.user_id, &req.new_price_id, req.apply_discount)
        .await?;

    Ok(Json(outcome))
}

/// Pull the current subscription state from Stripe
pub async fn sync(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<MessageResponse>, ApiError> {
    let synced = state
        .billing
        .subscriptions
        .sync_from_remote(&auth_user.user_id)
        .await?;

    Ok(Json(MessageResponse {
        success: synced,
        message: if synced {
            "Subscription status synced from Stripe".to_string()
        } else {
            "No subscription to sync".to_string()
        },
    }))
}

/// Zero the free-tier counter; active subscribers and admins only
pub async fn reset_message_count(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<MessageResponse>, ApiError> {
    let active = state
        .billing
        .subscriptions
        .current(&auth_user.user_id)
        .await?
        .is_some_and(|s| s.status == SubscriptionStatus::Active);

    if !active && !auth_user.is_admin() {
        return Err(ApiError::Forbidden(
            "Message count reset is only available for users with active subscriptions".to_string(),
        ));
    }

    if !state.billing.usage.reset(&auth_user.user_id).await? {
        return Err(ApiError::NotFound(format!("User not found: {}", auth_user.user_id)));
    }

    Ok(Json(MessageResponse {
        success: true,
        message: "Message count reset successfully".to_string(),
    }))
}
