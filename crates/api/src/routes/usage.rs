//! Free-tier usage routes

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Serialize;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Usage summary for the chat client
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatusResponse {
    pub message_count: i64,
    pub limit: i64,
    pub can_send: bool,
    pub remaining: i64,
}

pub async fn status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<UsageStatusResponse>, ApiError> {
    let entitlement = state
        .billing
        .entitlements
        .check(&auth_user.user_id, state.message_limit())
        .await?;

    Ok(Json(UsageStatusResponse {
        message_count: entitlement.message_count,
        limit: entitlement.limit,
        can_send: entitlement.allowed,
        remaining: (entitlement.limit - entitlement.message_count).max(0),
    }))
}
