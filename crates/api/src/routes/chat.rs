//! Gated chat route

use axum::{
    extract::{Extension, State},
    Json,
};
use lexfam_billing::UsageWarning;
use serde::{Deserialize, Serialize};

use crate::{answer::ChatTurn, auth::AuthUser, error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUsage {
    pub message_count: i64,
    pub limit: i64,
    /// Absent for unmetered tiers
    pub remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<UsageWarning>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub answer: String,
    pub usage: ChatUsage,
}

/// Answer one message, counting it against the free tier on success
pub async fn send_message(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let question = req.message.trim();
    if question.is_empty() {
        return Err(ApiError::Validation("Message must not be empty".to_string()));
    }

    let limit = state.message_limit();
    let entitlement = state
        .billing
        .entitlements
        .check(&auth_user.user_id, limit)
        .await?;

    if !entitlement.allowed {
        tracing::info!(
            user_id = %auth_user.user_id,
            message_count = entitlement.message_count,
            limit,
            "Free message limit reached"
        );
        return Err(ApiError::UsageLimitExceeded { limit });
    }

    let answer = state
        .answer_engine
        .answer(question, &req.history)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %auth_user.user_id, error = %e, "Answer engine call failed");
            ApiError::AnswerEngine(e.to_string())
        })?;

    let usage = if entitlement.counts_usage {
        let message_count = state.billing.usage.increment(&auth_user.user_id).await?;
        let after = lexfam_billing::evaluate(auth_user.role, None, message_count, limit);
        ChatUsage {
            message_count,
            limit,
            remaining: after.remaining(),
            warning: after.warning,
        }
    } else {
        ChatUsage {
            message_count: entitlement.message_count,
            limit,
            remaining: None,
            warning: None,
        }
    };

    Ok(Json(ChatResponse { answer, usage }))
}
