//! Stripe implementation of the billing gateway

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;
use stripe::generated::billing::subscription::{
    SubscriptionBillingCycleAnchor, SubscriptionProrationBehavior,
};
use stripe::{
    BillingPortalSession, CancelSubscription, CheckoutSession, CheckoutSessionMode, Coupon,
    CouponDuration, CreateBillingPortalSession, CreateCheckoutSession,
    CreateCheckoutSessionDiscounts, CreateCheckoutSessionLineItems, CreateCoupon, CreateCustomer,
    CreateInvoiceItem, Customer, CustomerId, InvoiceItem, Price, PriceId, Subscription,
    SubscriptionId, UpdateSubscription, UpdateSubscriptionItems,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    BillingGateway, CheckoutRequest, PriceChange, PriceSnapshot, SubscriptionSnapshot,
};

/// Billing gateway backed by the Stripe API
///
/// Each call is bounded by the configured request timeout. A timeout leaves
/// no local state behind and surfaces as [`BillingError::GatewayTimeout`].
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    async fn timed<T, F>(&self, operation: &'static str, call: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, stripe::StripeError>> + Send,
    {
        let timeout = self.stripe.config().request_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result.map_err(|e| {
                tracing::warn!(operation, error = %e, "Stripe call failed");
                BillingError::from(e)
            }),
            Err(_) => {
                tracing::warn!(
                    operation,
                    timeout_secs = timeout.as_secs(),
                    "Stripe call timed out"
                );
                Err(BillingError::GatewayTimeout(operation.to_string()))
            }
        }
    }
}

fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
    id.parse::<CustomerId>()
        .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))
}

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse::<SubscriptionId>()
        .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))
}

fn parse_price_id(id: &str) -> BillingResult<PriceId> {
    id.parse::<PriceId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid price ID: {}", e)))
}

fn parse_currency(currency: &str) -> BillingResult<stripe::Currency> {
    serde_json::from_value(serde_json::Value::String(currency.to_ascii_lowercase()))
        .map_err(|_| BillingError::InvalidInput(format!("Unsupported currency: {}", currency)))
}

/// Normalize a Stripe object through its JSON form
fn subscription_snapshot(subscription: &Subscription) -> BillingResult<SubscriptionSnapshot> {
    SubscriptionSnapshot::from_value(&to_json(subscription)?)
}

fn to_json<T: Serialize>(object: &T) -> BillingResult<serde_json::Value> {
    Ok(serde_json::to_value(object)?)
}

#[async_trait]
impl BillingGateway for StripeGateway {
    async fn customer_exists(&self, customer_id: &str) -> BillingResult<bool> {
        let id = parse_customer_id(customer_id)?;
        let client = self.stripe.inner();
        let timeout = self.stripe.config().request_timeout;

        match tokio::time::timeout(timeout, Customer::retrieve(client, &id, &[])).await {
            Ok(Ok(customer)) => Ok(!customer.deleted),
            Ok(Err(stripe::StripeError::Stripe(e))) if e.http_status == 404 => Ok(false),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(BillingError::GatewayTimeout("retrieve_customer".to_string())),
        }
    }

    async fn create_customer(
        &self,
        user_id: &str,
        email: &str,
        name: Option<&str>,
    ) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());

        let params = CreateCustomer {
            email: Some(email),
            name,
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = self
            .timed("create_customer", Customer::create(self.stripe.inner(), params))
            .await?;

        Ok(customer.id.to_string())
    }

    async fn create_coupon(&self, percent_off: f64, name: &str) -> BillingResult<String> {
        let mut params = CreateCoupon::new();
        params.percent_off = Some(percent_off);
        params.duration = Some(CouponDuration::Once);
        params.name = Some(name);

        let coupon = self
            .timed("create_coupon", Coupon::create(self.stripe.inner(), params))
            .await?;

        Ok(coupon.id.to_string())
    }

    async fn create_checkout_session(&self, request: &CheckoutRequest) -> BillingResult<String> {
        let customer_id = parse_customer_id(&request.customer_id)?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), request.user_id.clone());

        let mut params = CreateCheckoutSession {
            customer: Some(customer_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(request.price_id.clone()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&request.success_url),
            cancel_url: Some(&request.cancel_url),
            metadata: Some(metadata),
            billing_address_collection: Some(stripe::CheckoutSessionBillingAddressCollection::Required),
            ..Default::default()
        };

        // Stripe rejects discounts combined with promotion codes
        match &request.coupon_id {
            Some(coupon_id) => {
                params.discounts = Some(vec![CreateCheckoutSessionDiscounts {
                    coupon: Some(coupon_id.clone()),
                    ..Default::default()
                }]);
            }
            None => params.allow_promotion_codes = Some(true),
        }

        let session = self
            .timed("create_checkout_session", CheckoutSession::create(self.stripe.inner(), params))
            .await?;

        session
            .url
            .ok_or_else(|| BillingError::StripeApi("Checkout session has no URL".to_string()))
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let customer_id = parse_customer_id(customer_id)?;

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(return_url);

        let session = self
            .timed(
                "create_portal_session",
                BillingPortalSession::create(self.stripe.inner(), params),
            )
            .await?;

        Ok(session.url)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let id = parse_subscription_id(subscription_id)?;
        let subscription = self
            .timed(
                "retrieve_subscription",
                Subscription::retrieve(self.stripe.inner(), &id, &[]),
            )
            .await?;

        subscription_snapshot(&subscription)
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<PriceSnapshot> {
        let id = parse_price_id(price_id)?;
        let price = self
            .timed("retrieve_price", Price::retrieve(self.stripe.inner(), &id, &["product"]))
            .await?;

        PriceSnapshot::from_value(&to_json(&price)?)
    }

    async fn change_subscription_price(
        &self,
        change: &PriceChange,
    ) -> BillingResult<SubscriptionSnapshot> {
        let id = parse_subscription_id(&change.subscription_id)?;

        let mut params = UpdateSubscription::new();
        params.items = Some(vec![UpdateSubscriptionItems {
            id: Some(change.item_id.clone()),
            price: Some(change.new_price_id.clone()),
            ..Default::default()
        }]);
        params.proration_behavior = Some(SubscriptionProrationBehavior::AlwaysInvoice);
        if change.keep_billing_anchor {
            params.billing_cycle_anchor = Some(SubscriptionBillingCycleAnchor::Unchanged);
        }

        let subscription = self
            .timed(
                "update_subscription_price",
                Subscription::update(self.stripe.inner(), &id, params),
            )
            .await?;

        subscription_snapshot(&subscription)
    }

    async fn create_invoice_item(
        &self,
        customer_id: &str,
        amount: i64,
        currency: &str,
        description: &str,
    ) -> BillingResult<()> {
        let customer_id = parse_customer_id(customer_id)?;

        let mut params = CreateInvoiceItem::new(customer_id);
        params.amount = Some(amount);
        params.currency = Some(parse_currency(currency)?);
        params.description = Some(description);

        self.timed("create_invoice_item", InvoiceItem::create(self.stripe.inner(), params))
            .await?;

        Ok(())
    }

    async fn cancel_subscription_now(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let id = parse_subscription_id(subscription_id)?;
        let subscription = self
            .timed(
                "cancel_subscription",
                Subscription::cancel(self.stripe.inner(), &id, CancelSubscription::default()),
            )
            .await?;

        subscription_snapshot(&subscription)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<SubscriptionSnapshot> {
        let id = parse_subscription_id(subscription_id)?;

        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(cancel_at_period_end);

        let subscription = self
            .timed(
                "set_cancel_at_period_end",
                Subscription::update(self.stripe.inner(), &id, params),
            )
            .await?;

        subscription_snapshot(&subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_currency() {
        assert_eq!(parse_currency("USD").unwrap(), stripe::Currency::USD);
        assert!(matches!(parse_currency("zzz"), Err(BillingError::InvalidInput(_))));
    }

    #[test]
    fn test_parse_ids() {
        assert!(parse_customer_id("cus_123").is_ok());
        assert!(parse_subscription_id("sub_123").is_ok());
        assert!(parse_price_id("price_123").is_ok());
        assert!(parse_price_id("cus_123").is_err());
    }
}
