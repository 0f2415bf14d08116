//! Authentication routes

use axum::{
    extract::{Extension, State},
    Json,
};
use lexfam_shared::{Provider, Role};
use serde::{Deserialize, Serialize};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub success: bool,
    pub message: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role: Role,
    pub provider: Provider,
    pub message_count: i64,
}

/// Register a password account
pub async fn signup(
    State(state): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> Result<Json<SignupResponse>, ApiError> {
    let user = state
        .billing
        .users
        .signup(&req.email, &req.password, req.display_name.as_deref())
        .await?;

    Ok(Json(SignupResponse {
        success: true,
        message: "Account created successfully".to_string(),
        user_id: user.identifier,
    }))
}

/// Exchange credentials for an access token
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let user = state
        .billing
        .users
        .authenticate(&req.email, &req.password)
        .await?
        .ok_or(ApiError::InvalidCredentials)?;

    let (access_token, jti) = state
        .jwt
        .generate_access_token(&user.identifier, user.role, user.email.as_deref())
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to issue access token");
            ApiError::Internal
        })?;

    tracing::info!(user_id = %user.identifier, jti = %jti, "User logged in");

    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in: state.jwt.access_token_expiry_seconds(),
    }))
}

/// Current user profile
pub async fn me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = state.billing.users.require(&auth_user.user_id).await?;

    Ok(Json(UserResponse {
        user_id: user.identifier,
        email: user.email,
        display_name: user.display_name,
        role: user.role,
        provider: user.provider,
        message_count: user.message_count,
    }))
}
