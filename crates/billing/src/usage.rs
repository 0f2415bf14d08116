//! Per-user message counter gating free-tier chat usage

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BillingResult;

/// Storage port for message counts
///
/// Unknown users read as zero and are never created by these calls.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get_count(&self, user_id: &str) -> BillingResult<i64>;

    /// Atomic increment-and-return; 0 for unknown users
    async fn increment(&self, user_id: &str) -> BillingResult<i64>;

    /// Returns false when the user is unknown
    async fn reset(&self, user_id: &str) -> BillingResult<bool>;
}

/// Outcome of a free-tier limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCheck {
    pub allowed: bool,
    pub current_count: i64,
}

/// Message counter service
#[derive(Clone)]
pub struct UsageCounter {
    store: Arc<dyn UsageStore>,
}

impl UsageCounter {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    pub async fn get_count(&self, user_id: &str) -> BillingResult<i64> {
        self.store.get_count(user_id).await
    }

    pub async fn increment(&self, user_id: &str) -> BillingResult<i64> {
        let count = self.store.increment(user_id).await?;
        tracing::debug!(user_id = %user_id, message_count = count, "Incremented message count");
        Ok(count)
    }

    pub async fn reset(&self, user_id: &str) -> BillingResult<bool> {
        let reset = self.store.reset(user_id).await?;
        if reset {
            tracing::info!(user_id = %user_id, "Reset message count");
        }
        Ok(reset)
    }

    pub async fn check_limit(&self, user_id: &str, limit: i64) -> BillingResult<UsageCheck> {
        let current_count = self.store.get_count(user_id).await?;
        Ok(UsageCheck {
            allowed: current_count < limit,
            current_count,
        })
    }
}
