//! Admin routes
//!
//! Mounted behind `require_auth` and `require_admin`; the admin check uses
//! the role stored on the user, not the token claim.

pub mod shared;

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use lexfam_billing::WebhookOutcome;
use lexfam_billing::subscriptions::format_timestamp;
use lexfam_shared::Role;
use serde::{Deserialize, Serialize};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

use self::shared::{
    AdminInvoice, AdminSubscription, AdminUser, AdminUsersResponse, BillingHistoryResponse,
    LimitQuery, PageQuery,
};

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct RoleResponse {
    pub success: bool,
    pub message: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub cancel_immediately: bool,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionsResponse {
    pub subscriptions: Vec<AdminSubscription>,
}

#[derive(Debug, Serialize)]
pub struct UserSubscriptionResponse {
    pub subscription: Option<AdminSubscription>,
}

#[derive(Debug, Serialize)]
pub struct FailedEvent {
    pub event_id: String,
    pub event_type: String,
    pub result: String,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub event_created_at: Option<String>,
    pub last_attempt_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FailedEventsResponse {
    pub events: Vec<FailedEvent>,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub event_id: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<AdminUsersResponse>, ApiError> {
    let page = query.page();
    let (users, total) = state.billing.users.list(page).await?;

    Ok(Json(AdminUsersResponse {
        users: users.into_iter().map(AdminUser::from).collect(),
        total,
        page: page.page,
        limit: page.limit,
    }))
}

pub async fn update_user_role(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<String>,
    Json(req): Json<UpdateRoleRequest>,
) -> Result<Json<RoleResponse>, ApiError> {
    let role = state.billing.users.set_role(&user_id, &req.role).await?;

    tracing::info!(
        admin_id = %admin.user_id,
        user_id = %user_id,
        role = %role,
        "Admin changed user role"
    );

    Ok(Json(RoleResponse {
        success: true,
        message: format!("User role updated to {role}"),
        role,
    }))
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<SubscriptionsResponse>, ApiError> {
    let rows = state.billing.subscriptions.list_subscriptions(query.page()).await?;

    Ok(Json(SubscriptionsResponse {
        subscriptions: rows.into_iter().map(AdminSubscription::from).collect(),
    }))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(subscription_id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .billing
        .subscriptions
        .cancel_by_id(&subscription_id, query.cancel_immediately)
        .await?;

    tracing::info!(
        admin_id = %admin.user_id,
        subscription_id = %subscription_id,
        immediate = query.cancel_immediately,
        "Admin canceled subscription"
    );

    Ok(Json(MessageResponse {
        success: true,
        message: "Subscription cancelled successfully".to_string(),
    }))
}

pub async fn global_billing(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<BillingHistoryResponse>, ApiError> {
    let rows = state.billing.subscriptions.list_invoices(query.page()).await?;

    Ok(Json(BillingHistoryResponse {
        billing_history: rows.into_iter().map(AdminInvoice::from).collect(),
    }))
}

pub async fn user_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserSubscriptionResponse>, ApiError> {
    let user = state.billing.users.require(&user_id).await?;
    let subscription = state
        .billing
        .subscriptions
        .current(&user_id)
        .await?
        .map(|record| AdminSubscription::new(record, user.email));

    Ok(Json(UserSubscriptionResponse { subscription }))
}

pub async fn user_billing(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<BillingHistoryResponse>, ApiError> {
    let invoices = state
        .billing
        .subscriptions
        .invoices_for_user(&user_id, query.limit.unwrap_or(50))
        .await?;

    Ok(Json(BillingHistoryResponse {
        billing_history: invoices
            .into_iter()
            .map(|invoice| AdminInvoice::new(invoice, None))
            .collect(),
    }))
}

pub async fn failed_webhooks(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<FailedEventsResponse>, ApiError> {
    let events = state
        .billing
        .webhooks
        .list_failed(query.limit.unwrap_or(50))
        .await?;

    Ok(Json(FailedEventsResponse {
        events: events
            .into_iter()
            .map(|e| FailedEvent {
                event_id: e.event_id,
                event_type: e.event_type,
                result: e.result.as_str().to_string(),
                error_message: e.error_message,
                attempts: e.attempts,
                event_created_at: format_timestamp(e.event_created_at),
                last_attempt_at: format_timestamp(e.processing_started_at),
            })
            .collect(),
    }))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(event_id): Path<String>,
) -> Result<Json<ReplayResponse>, ApiError> {
    tracing::info!(admin_id = %admin.user_id, event_id = %event_id, "Admin replaying webhook event");

    let outcome = state.billing.webhooks.replay(&event_id).await?;
    let (outcome, reason) = match outcome {
        WebhookOutcome::Processed => ("processed", None),
        WebhookOutcome::Duplicate => ("duplicate", None),
        WebhookOutcome::Ignored => ("ignored", None),
        WebhookOutcome::Unprocessable(reason) => ("unprocessable", Some(reason)),
    };

    Ok(Json(ReplayResponse {
        event_id,
        outcome: outcome.to_string(),
        reason,
    }))
}
