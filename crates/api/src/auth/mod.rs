//! Authentication module for Lexfam

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{require_admin, require_auth, AuthUser};
