//! JWT token generation and validation

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use lexfam_shared::Role;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// JWT claims for Lexfam-issued access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user identifier)
    pub sub: String,
    /// Role at issue time; authorization re-reads the stored role
    pub role: Role,
    pub email: Option<String>,
    pub iat: i64,
    pub exp: i64,
    /// JWT ID, logged for request tracing
    pub jti: String,
}

/// JWT manager for token operations
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, access_token_expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_token_expiry_hours,
        }
    }

    /// Generate an access token; returns the token and its JTI
    pub fn generate_access_token(
        &self,
        user_id: &str,
        role: Role,
        email: Option<&str>,
    ) -> Result<(String, String), JwtError> {
        let now = OffsetDateTime::now_utc();
        let exp = now + Duration::hours(self.access_token_expiry_hours);
        let jti = Uuid::new_v4().to_string();

        let claims = Claims {
            sub: user_id.to_string(),
            role,
            email: email.map(str::to_string),
            iat: now.unix_timestamp(),
            exp: exp.unix_timestamp(),
            jti: jti.clone(),
        };

        // Explicit algorithm prevents algorithm confusion
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))?;

        Ok((token, jti))
    }

    /// Validate and decode a token
    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // clock skew tolerance

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_hours * 3600
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token encoding failed: {0}")]
    Encoding(String),
    #[error("Token validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-at-least-32-chars!";

    #[test]
    fn test_token_generation_and_validation() {
        let jwt = JwtManager::new(SECRET, 24);

        let (token, jti) = jwt
            .generate_access_token("parent@example.com", Role::User, Some("parent@example.com"))
            .expect("Failed to generate token");

        let claims = jwt.validate_token(&token).expect("Invalid token");
        assert_eq!(claims.sub, "parent@example.com");
        assert_eq!(claims.role, Role::User);
        assert_eq!(claims.jti, jti);
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
        assert_eq!(jwt.access_token_expiry_seconds(), 86_400);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = JwtManager::new(SECRET, 24);
        let other = JwtManager::new("another-secret-key-at-least-32-chars", 24);

        let (token, _) = issuer
            .generate_access_token("parent@example.com", Role::Admin, None)
            .expect("Failed to generate token");

        assert!(other.validate_token(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        // Past the 60s leeway
        let jwt = JwtManager::new(SECRET, -1);
        let (token, _) = jwt
            .generate_access_token("parent@example.com", Role::User, None)
            .expect("Failed to generate token");

        assert!(matches!(jwt.validate_token(&token), Err(JwtError::Expired)));
    }

    #[test]
    fn test_garbage_rejected() {
        let jwt = JwtManager::new(SECRET, 24);
        assert!(jwt.validate_token("not.a.jwt").is_err());
    }
}
