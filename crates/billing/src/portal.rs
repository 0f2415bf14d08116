//! Stripe Billing Portal

use std::sync::Arc;

use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::gateway::BillingGateway;
use crate::subscriptions::SubscriptionStore;

/// Portal service for Stripe billing portal sessions
#[derive(Clone)]
pub struct PortalService {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn BillingGateway>,
    app_base_url: String,
}

impl PortalService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn BillingGateway>,
        app_base_url: String,
    ) -> Self {
        Self {
            store,
            gateway,
            app_base_url,
        }
    }

    /// Create a billing portal session for the user's customer
    pub async fn create_portal_session(
        &self,
        user_id: &str,
        return_url: Option<&str>,
    ) -> BillingResult<String> {
        let customer_id = self
            .store
            .get_customer_id(user_id)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(user_id.to_string()))?;

        let default_return = format!("{}/subscription", self.app_base_url);
        let return_url = return_url.unwrap_or(&default_return);

        let url = self
            .gateway
            .create_portal_session(&customer_id, return_url)
            .await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer_id,
            "Created billing portal session"
        );

        Ok(url)
    }
}

/// Response for creating a portal session
#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub portal_url: String,
}
