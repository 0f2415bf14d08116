//! Stripe client configuration

use std::time::Duration;

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Default bound on a single Stripe API call
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret; events are parsed unverified without it
    pub webhook_secret: Option<String>,
    /// Price IDs for the two Pro plans
    pub price_ids: PriceIds,
    /// Base URL used when callers omit redirect URLs
    pub app_base_url: String,
    /// Upper bound for each remote call
    pub request_timeout: Duration,
}

/// Stripe price IDs for the plan catalog
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub monthly: String,
    pub yearly: String,
}

impl PriceIds {
    pub fn contains(&self, price_id: &str) -> bool {
        self.monthly == price_id || self.yearly == price_id
    }
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let request_timeout = std::env::var("STRIPE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            price_ids: PriceIds {
                monthly: std::env::var("STRIPE_MONTHLY_PRICE_ID").map_err(|_| {
                    BillingError::Config("STRIPE_MONTHLY_PRICE_ID not set".to_string())
                })?,
                yearly: std::env::var("STRIPE_YEARLY_PRICE_ID").map_err(|_| {
                    BillingError::Config("STRIPE_YEARLY_PRICE_ID not set".to_string())
                })?,
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            request_timeout: Duration::from_secs(request_timeout),
        })
    }
}

/// Stripe client wrapper
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the configuration
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
