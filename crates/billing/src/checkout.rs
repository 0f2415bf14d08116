//! Stripe Checkout sessions for new subscriptions

use std::sync::Arc;

use lexfam_shared::User;
use serde::{Deserialize, Serialize};

use crate::client::PriceIds;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{BillingGateway, CheckoutRequest};
use crate::plans::{CHECKOUT_COUPON_NAME, DISCOUNT_PERCENT};

/// Checkout request from the pricing page
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutParams {
    pub price_id: String,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
    #[serde(default)]
    pub apply_discount: bool,
}

/// Response for creating a checkout session
#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub checkout_url: String,
}

/// Checkout service for Stripe checkout sessions
#[derive(Clone)]
pub struct CheckoutService {
    customers: CustomerService,
    gateway: Arc<dyn BillingGateway>,
    price_ids: PriceIds,
    app_base_url: String,
}

impl CheckoutService {
    pub fn new(
        customers: CustomerService,
        gateway: Arc<dyn BillingGateway>,
        price_ids: PriceIds,
        app_base_url: String,
    ) -> Self {
        Self {
            customers,
            gateway,
            price_ids,
            app_base_url,
        }
    }

    /// Create a subscription checkout session for a user
    pub async fn create_session(&self, user: &User, params: &CheckoutParams) -> BillingResult<String> {
        if !self.price_ids.contains(&params.price_id) {
            return Err(BillingError::InvalidInput(format!(
                "Unknown price: {}",
                params.price_id
            )));
        }

        let email = user.email.as_deref().unwrap_or(&user.identifier);
        let customer_id = self
            .customers
            .ensure_customer(&user.identifier, email, user.display_name.as_deref())
            .await?;

        let coupon_id = if params.apply_discount {
            match self
                .gateway
                .create_coupon(DISCOUNT_PERCENT, CHECKOUT_COUPON_NAME)
                .await
            {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!(
                        user_id = %user.identifier,
                        error = %e,
                        "Failed to create checkout coupon, continuing without discount"
                    );
                    None
                }
            }
        } else {
            None
        };

        let base_url = &self.app_base_url;
        let request = CheckoutRequest {
            customer_id,
            price_id: params.price_id.clone(),
            success_url: params.success_url.clone().unwrap_or_else(|| {
                format!("{base_url}/subscription/success?session_id={{CHECKOUT_SESSION_ID}}")
            }),
            cancel_url: params
                .cancel_url
                .clone()
                .unwrap_or_else(|| format!("{base_url}/pricing")),
            user_id: user.identifier.clone(),
            coupon_id,
        };

        let url = self.gateway.create_checkout_session(&request).await?;

        tracing::info!(
            user_id = %user.identifier,
            customer_id = %request.customer_id,
            price_id = %request.price_id,
            discounted = request.coupon_id.is_some(),
            "Created checkout session"
        );

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::testing::FakeGateway;
    use lexfam_shared::Role;

    async fn setup() -> (Arc<FakeGateway>, CheckoutService, User) {
        let store = Arc::new(MemoryStore::with_sample_catalog());
        let user = store.seed_user("u@example.com", Role::User).await;
        let gateway = Arc::new(FakeGateway::new());
        let service = CheckoutService::new(
            CustomerService::new(store.clone(), gateway.clone()),
            gateway.clone(),
            PriceIds {
                monthly: "price_sample_monthly".to_string(),
                yearly: "price_sample_yearly".to_string(),
            },
            "http://app".to_string(),
        );
        (gateway, service, user)
    }

    fn params(price_id: &str, apply_discount: bool) -> CheckoutParams {
        CheckoutParams {
            price_id: price_id.to_string(),
            success_url: None,
            cancel_url: None,
            apply_discount,
        }
    }

    #[tokio::test]
    async fn test_unknown_price_is_rejected_before_any_remote_call() {
        let (gateway, service, user) = setup().await;
        let err = service.create_session(&user, &params("price_x", false)).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
        assert!(gateway.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_discounted_checkout_attaches_coupon() {
        let (gateway, service, user) = setup().await;
        let url = service
            .create_session(&user, &params("price_sample_yearly", true))
            .await
            .unwrap();
        assert!(url.starts_with("https://checkout.stripe.test/"));

        let calls = gateway.calls().await;
        assert_eq!(calls[1], "create_coupon:20");
        assert!(calls[2].starts_with("checkout:cus_fake_1:price_sample_yearly:coupon=coupon_fake_"));
    }

    #[tokio::test]
    async fn test_coupon_failure_falls_back_to_plain_checkout() {
        let (gateway, service, user) = setup().await;
        gateway.fail_coupons().await;

        service
            .create_session(&user, &params("price_sample_yearly", true))
            .await
            .unwrap();

        let calls = gateway.calls().await;
        assert!(calls.last().unwrap().ends_with("coupon=none"));
    }
}
