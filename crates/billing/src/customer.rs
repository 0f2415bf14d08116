//! Stripe customer management

use std::sync::Arc;

use crate::error::BillingResult;
use crate::gateway::BillingGateway;
use crate::subscriptions::SubscriptionStore;

/// Keeps each user mapped to a live Stripe customer
#[derive(Clone)]
pub struct CustomerService {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn BillingGateway>,
}

impl CustomerService {
    pub fn new(store: Arc<dyn SubscriptionStore>, gateway: Arc<dyn BillingGateway>) -> Self {
        Self { store, gateway }
    }

    /// Return the user's customer, creating one if the mapping is missing or stale
    ///
    /// A mapped customer that Stripe no longer knows (deleted, or created in a
    /// different account) is replaced rather than reported as an error.
    pub async fn ensure_customer(
        &self,
        user_id: &str,
        email: &str,
        name: Option<&str>,
    ) -> BillingResult<String> {
        if let Some(customer_id) = self.store.get_customer_id(user_id).await? {
            if self.gateway.customer_exists(&customer_id).await? {
                return Ok(customer_id);
            }

            tracing::warn!(
                user_id = %user_id,
                customer_id = %customer_id,
                "Mapped Stripe customer no longer exists, creating a new one"
            );
        }

        let customer_id = self.gateway.create_customer(user_id, email, name).await?;
        self.store
            .upsert_customer(user_id, &customer_id, Some(email), name)
            .await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer_id,
            "Created Stripe customer"
        );

        Ok(customer_id)
    }

    /// Get the mapped customer id without contacting Stripe
    pub async fn get_customer_id(&self, user_id: &str) -> BillingResult<Option<String>> {
        self.store.get_customer_id(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::testing::FakeGateway;
    use lexfam_shared::Role;

    async fn setup() -> (Arc<MemoryStore>, Arc<FakeGateway>, CustomerService) {
        let store = Arc::new(MemoryStore::new());
        store.seed_user("u@example.com", Role::User).await;
        let gateway = Arc::new(FakeGateway::new());
        let service = CustomerService::new(store.clone(), gateway.clone());
        (store, gateway, service)
    }

    #[tokio::test]
    async fn test_creates_and_then_reuses_customer() {
        let (store, gateway, service) = setup().await;

        let first = service.ensure_customer("u@example.com", "u@example.com", None).await.unwrap();
        let second = service.ensure_customer("u@example.com", "u@example.com", None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.get_customer_id("u@example.com").await.unwrap(), Some(first.clone()));
        assert_eq!(
            gateway.calls().await,
            vec![
                "create_customer:u@example.com".to_string(),
                format!("customer_exists:{first}"),
            ]
        );
    }

    #[tokio::test]
    async fn test_replaces_customer_unknown_to_stripe() {
        let (store, _gateway, service) = setup().await;
        store
            .upsert_customer("u@example.com", "cus_deleted", None, None)
            .await
            .unwrap();

        let customer_id = service.ensure_customer("u@example.com", "u@example.com", None).await.unwrap();

        assert_ne!(customer_id, "cus_deleted");
        assert_eq!(store.get_customer_id("u@example.com").await.unwrap(), Some(customer_id));
        assert_eq!(store.find_user_by_customer("cus_deleted").await.unwrap(), None);
    }
}
