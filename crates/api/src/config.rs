//! Application configuration

use std::env;
use std::time::Duration;

/// Minimum JWT signing secret length
const MIN_SECRET_LENGTH: usize = 32;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Auth
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,

    // Usage
    pub free_user_message_limit: i64,

    // CORS
    pub cors_allowed_origins: Vec<String>,

    // Answer engine
    pub answer_engine_url: String,
    pub answer_engine_timeout: Duration,

    // Logging
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < MIN_SECRET_LENGTH {
            return Err(ConfigError::WeakSecret(
                "JWT_SECRET must be at least 32 characters",
            ));
        }

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 5),
            run_migrations: parse_or("RUN_MIGRATIONS", true),

            jwt_secret,
            jwt_expiry_hours: parse_or("JWT_EXPIRY_HOURS", 24),

            free_user_message_limit: parse_or("FREE_USER_MESSAGE_LIMIT", 20i64).max(0),

            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string())
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect(),

            answer_engine_url: env::var("ANSWER_ENGINE_URL")
                .unwrap_or_else(|_| "http://localhost:8001/answer".to_string()),
            answer_engine_timeout: Duration::from_secs(parse_or("ANSWER_ENGINE_TIMEOUT_SECS", 60)),

            log_json: env::var("LOG_FORMAT")
                .map(|format| format.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
