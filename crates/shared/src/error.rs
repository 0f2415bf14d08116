//! Validation error types shared across crates

use thiserror::Error;

/// Errors raised when user-supplied values fail domain validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid email format")]
    InvalidEmail,

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Invalid provider: {0}")]
    InvalidProvider(String),

    #[error("Invalid subscription status: {0}")]
    InvalidStatus(String),

    #[error("Invalid billing interval: {0}")]
    InvalidInterval(String),
}
