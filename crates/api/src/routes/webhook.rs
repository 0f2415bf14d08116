//! Stripe webhook endpoint

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};
use lexfam_billing::WebhookOutcome;

use crate::{error::ApiError, state::AppState};

/// Handle Stripe webhook events
///
/// Redeliveries and unknown customers still answer 200 so Stripe stops
/// retrying; only processing failures return 500.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let signature = headers.get("stripe-signature").and_then(|v| v.to_str().ok());

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook rejected");
            ApiError::InvalidWebhook(e.to_string())
        })?;

    let outcome = state.billing.webhooks.handle_event(&event).await.map_err(|e| {
        tracing::error!(event_id = %event.id, error = %e, "Webhook handling error");
        ApiError::Internal
    })?;

    match outcome {
        WebhookOutcome::Unprocessable(reason) => {
            tracing::warn!(event_id = %event.id, reason = %reason, "Stripe webhook unprocessable");
        }
        other => {
            tracing::info!(event_id = %event.id, outcome = ?other, "Stripe webhook handled");
        }
    }

    Ok(StatusCode::OK)
}
