//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lexfam_billing::{BillingError, ErrorKind};
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Invalid webhook: {0}")]
    InvalidWebhook(String),

    // Resource errors
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),

    // Usage
    #[error("Free message limit of {limit} reached")]
    UsageLimitExceeded { limit: i64 },

    // Upstream errors
    #[error("Payment provider error: {0}")]
    Gateway(String),
    #[error("Payment provider timed out")]
    GatewayTimeout,
    #[error("Answer engine error: {0}")]
    AnswerEngine(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS", self.to_string()),
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::InvalidWebhook(msg) => (StatusCode::BAD_REQUEST, "INVALID_WEBHOOK", msg.clone()),

            // Resources
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Usage
            ApiError::UsageLimitExceeded { .. } => (StatusCode::PAYMENT_REQUIRED, "USAGE_LIMIT_EXCEEDED", self.to_string()),

            // Upstream
            ApiError::Gateway(_) => (StatusCode::BAD_GATEWAY, "PAYMENT_PROVIDER_ERROR", "Payment provider error".to_string()),
            ApiError::GatewayTimeout => (StatusCode::SERVICE_UNAVAILABLE, "PAYMENT_PROVIDER_TIMEOUT", self.to_string()),
            ApiError::AnswerEngine(_) => (StatusCode::BAD_GATEWAY, "ANSWER_ENGINE_ERROR", "Answer engine unavailable".to_string()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err.kind() {
            ErrorKind::Validation => ApiError::Validation(strip_prefix(&err)),
            ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
            ErrorKind::Conflict => ApiError::Conflict(strip_prefix(&err)),
            ErrorKind::Unauthorized => ApiError::Unauthorized,
            ErrorKind::Signature => ApiError::InvalidWebhook(err.to_string()),
            ErrorKind::Gateway => {
                tracing::error!(error = %err, "Payment provider call failed");
                ApiError::Gateway(err.to_string())
            }
            ErrorKind::Timeout => {
                tracing::warn!(error = %err, "Payment provider call timed out");
                ApiError::GatewayTimeout
            }
            ErrorKind::Persistence => {
                tracing::error!(error = %err, "Billing storage error");
                ApiError::Database(err.to_string())
            }
            ErrorKind::Internal => {
                tracing::error!(error = %err, "Billing internal error");
                ApiError::Internal
            }
        }
    }
}

/// Drop the "Invalid input: " style prefix so clients see the bare reason
fn strip_prefix(err: &BillingError) -> String {
    match err {
        BillingError::InvalidInput(msg) | BillingError::AlreadyExists(msg) => msg.clone(),
        other => other.to_string(),
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("23505") {
                    return ApiError::Conflict("Resource already exists".to_string());
                }
                ApiError::Database(db_err.to_string())
            }
            _ => ApiError::Database(err.to_string()),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
