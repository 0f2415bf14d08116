//! Lexfam Shared Types and Utilities
//!
//! Domain vocabulary, input validation and database plumbing shared by the
//! API server, the billing crate and the background worker.

pub mod db;
pub mod error;
pub mod types;
pub mod validation;

pub use db::*;
pub use error::*;
pub use types::*;
pub use validation::{normalize_email, validate_email};
