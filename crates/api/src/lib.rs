//! Lexfam API Library
//!
//! HTTP boundary for the family-law assistant: accounts, the gated chat
//! endpoint, subscription management, Stripe webhooks and admin tools.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod answer;
pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use answer::{AnswerEngine, HttpAnswerEngine};
pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
