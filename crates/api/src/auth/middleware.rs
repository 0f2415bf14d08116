//! Authentication middleware

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
    Extension,
};
use lexfam_shared::Role;

use crate::{error::ApiError, state::AppState};

/// Authenticated caller, inserted as a request extension by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
    /// Stored role, not the one baked into the token
    pub role: Role,
    pub jti: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Require a valid bearer token for a user that still exists
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&req).ok_or(ApiError::Unauthorized)?;

    let claims = state.jwt.validate_token(token).map_err(|e| {
        tracing::debug!(error = %e, "Rejected bearer token");
        ApiError::InvalidToken
    })?;

    let user = state.billing.users.get(&claims.sub).await?.ok_or_else(|| {
        tracing::warn!(user_id = %claims.sub, "Token for unknown user");
        ApiError::InvalidToken
    })?;

    req.extensions_mut().insert(AuthUser {
        user_id: user.identifier,
        email: user.email,
        role: user.role,
        jti: claims.jti,
    });

    Ok(next.run(req).await)
}

/// Require the ADMIN role; layer inside [`require_auth`]
pub async fn require_admin(
    Extension(auth_user): Extension<AuthUser>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !auth_user.is_admin() {
        tracing::warn!(user_id = %auth_user.user_id, "Non-admin attempted admin route");
        return Err(ApiError::Forbidden("Admin access required".to_string()));
    }

    Ok(next.run(req).await)
}
