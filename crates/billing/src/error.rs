//! Billing error types

use lexfam_shared::ValidationError;
use thiserror::Error;

use crate::password::{PasswordError, PasswordValidationError};

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Stripe request timed out: {0}")]
    GatewayTimeout(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Malformed billing object: {0}")]
    MalformedPayload(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

/// Coarse error category used by callers to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Signature,
    Gateway,
    Timeout,
    Persistence,
    Internal,
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::InvalidInput(_) => ErrorKind::Validation,
            BillingError::CustomerNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::UserNotFound(_)
            | BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::AlreadyExists(_) => ErrorKind::Conflict,
            BillingError::Unauthorized(_) => ErrorKind::Unauthorized,
            BillingError::WebhookSignatureInvalid | BillingError::WebhookPayloadInvalid(_) => {
                ErrorKind::Signature
            }
            BillingError::StripeApi(_) | BillingError::MalformedPayload(_) => ErrorKind::Gateway,
            BillingError::GatewayTimeout(_) => ErrorKind::Timeout,
            BillingError::Database(_) => ErrorKind::Persistence,
            BillingError::Config(_) | BillingError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Gateway | ErrorKind::Persistence
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match err {
            stripe::StripeError::Timeout => BillingError::GatewayTimeout("stripe client timeout".to_string()),
            other => BillingError::StripeApi(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::MalformedPayload(err.to_string())
    }
}

impl From<ValidationError> for BillingError {
    fn from(err: ValidationError) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

impl From<PasswordValidationError> for BillingError {
    fn from(err: PasswordValidationError) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

impl From<PasswordError> for BillingError {
    fn from(err: PasswordError) -> Self {
        BillingError::Internal(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
