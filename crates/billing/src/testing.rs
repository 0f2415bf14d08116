//! Test doubles shared by this crate's tests and downstream crates
//!
//! Enabled for `cfg(test)` and by the `testing` feature.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use lexfam_shared::{BillingInterval, SubscriptionStatus};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    BillingGateway, CheckoutRequest, PriceChange, PriceSnapshot, SubscriptionSnapshot,
};
use crate::subscriptions::NewSubscription;

const PERIOD_START: i64 = 1_700_000_000;
const PERIOD_DAYS: i64 = 30;

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    customers: HashSet<String>,
    subscriptions: HashMap<String, SubscriptionSnapshot>,
    prices: HashMap<String, PriceSnapshot>,
    next_id: u32,
    fail_next: Option<BillingError>,
    fail_invoice_items: bool,
    fail_coupons: bool,
}

impl FakeState {
    fn call(&mut self, call: String) -> BillingResult<()> {
        self.calls.push(call);
        match self.fail_next.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_fake_{}", self.next_id)
    }

    fn subscription(&self, id: &str) -> BillingResult<SubscriptionSnapshot> {
        self.subscriptions
            .get(id)
            .cloned()
            .ok_or_else(|| BillingError::StripeApi(format!("No such subscription: '{id}'")))
    }
}

/// Recording gateway with scripted remote state
///
/// Every trait call is appended to [`FakeGateway::calls`] as a short string
/// such as `retrieve_subscription:sub_1`. Seeding helpers are not recorded.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// An active monthly subscription on the sample "Pro Plan" product
    pub fn active_snapshot(subscription_id: &str, customer_id: &str, price_id: &str) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: subscription_id.to_string(),
            customer_id: Some(customer_id.to_string()),
            status: SubscriptionStatus::Active,
            cancel_at_period_end: false,
            cancel_at: None,
            current_period_start: Some(PERIOD_START),
            current_period_end: Some(PERIOD_START + PERIOD_DAYS * 86_400),
            created: Some(PERIOD_START),
            item_id: Some(format!("si_{subscription_id}")),
            price: Some(PriceSnapshot {
                id: price_id.to_string(),
                product_id: Some("prod_sample_pro".to_string()),
                product_name: Some("Pro Plan".to_string()),
                unit_amount: Some(3900),
                currency: Some("usd".to_string()),
                interval: Some(BillingInterval::Month),
            }),
        }
    }

    pub async fn put_customer(&self, customer_id: &str) {
        self.state.lock().await.customers.insert(customer_id.to_string());
    }

    pub async fn put_subscription(&self, snapshot: SubscriptionSnapshot) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(snapshot.id.clone(), snapshot);
    }

    pub async fn put_price(&self, price: PriceSnapshot) {
        self.state.lock().await.prices.insert(price.id.clone(), price);
    }

    /// Fail the next gateway call with `error`
    pub async fn fail_next(&self, error: BillingError) {
        self.state.lock().await.fail_next = Some(error);
    }

    /// Make every invoice item creation fail
    pub async fn fail_invoice_items(&self) {
        self.state.lock().await.fail_invoice_items = true;
    }

    /// Make every coupon creation fail
    pub async fn fail_coupons(&self) {
        self.state.lock().await.fail_coupons = true;
    }

    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }
}

#[async_trait]
impl BillingGateway for FakeGateway {
    async fn customer_exists(&self, customer_id: &str) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        state.call(format!("customer_exists:{customer_id}"))?;
        Ok(state.customers.contains(customer_id))
    }

    async fn create_customer(
        &self,
        user_id: &str,
        _email: &str,
        _name: Option<&str>,
    ) -> BillingResult<String> {
        let mut state = self.state.lock().await;
        state.call(format!("create_customer:{user_id}"))?;
        let id = state.next_id("cus");
        state.customers.insert(id.clone());
        Ok(id)
    }

    async fn create_coupon(&self, percent_off: f64, _name: &str) -> BillingResult<String> {
        let mut state = self.state.lock().await;
        state.call(format!("create_coupon:{percent_off}"))?;
        if state.fail_coupons {
            return Err(BillingError::StripeApi("coupons disabled".to_string()));
        }
        Ok(state.next_id("coupon"))
    }

    async fn create_checkout_session(&self, request: &CheckoutRequest) -> BillingResult<String> {
        let mut state = self.state.lock().await;
        state.call(format!(
            "checkout:{}:{}:coupon={}",
            request.customer_id,
            request.price_id,
            request.coupon_id.as_deref().unwrap_or("none")
        ))?;
        let id = state.next_id("cs");
        Ok(format!("https://checkout.stripe.test/c/pay/{id}"))
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        _return_url: &str,
    ) -> BillingResult<String> {
        let mut state = self.state.lock().await;
        state.call(format!("portal:{customer_id}"))?;
        Ok(format!("https://billing.stripe.test/p/session/{customer_id}"))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;
        state.call(format!("retrieve_subscription:{subscription_id}"))?;
        state.subscription(subscription_id)
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<PriceSnapshot> {
        let mut state = self.state.lock().await;
        state.call(format!("retrieve_price:{price_id}"))?;
        state
            .prices
            .get(price_id)
            .cloned()
            .ok_or_else(|| BillingError::StripeApi(format!("No such price: '{price_id}'")))
    }

    async fn change_subscription_price(
        &self,
        change: &PriceChange,
    ) -> BillingResult<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;
        state.call(format!(
            "change_price:{}:{}:anchor={}",
            change.subscription_id, change.new_price_id, change.keep_billing_anchor
        ))?;

        let mut snapshot = state.subscription(&change.subscription_id)?;
        let price = state.prices.get(&change.new_price_id).cloned().unwrap_or(PriceSnapshot {
            id: change.new_price_id.clone(),
            product_id: None,
            product_name: None,
            unit_amount: None,
            currency: None,
            interval: None,
        });
        snapshot.price = Some(price);
        state
            .subscriptions
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn create_invoice_item(
        &self,
        customer_id: &str,
        amount: i64,
        currency: &str,
        _description: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.call(format!("invoice_item:{customer_id}:{amount}:{currency}"))?;
        if state.fail_invoice_items {
            return Err(BillingError::StripeApi("invoice items disabled".to_string()));
        }
        Ok(())
    }

    async fn cancel_subscription_now(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;
        state.call(format!("cancel_now:{subscription_id}"))?;

        let mut snapshot = state.subscription(subscription_id)?;
        snapshot.status = SubscriptionStatus::Canceled;
        snapshot.cancel_at_period_end = false;
        state
            .subscriptions
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<SubscriptionSnapshot> {
        let mut state = self.state.lock().await;
        state.call(format!(
            "set_cancel_at_period_end:{subscription_id}:{cancel_at_period_end}"
        ))?;

        let mut snapshot = state.subscription(subscription_id)?;
        snapshot.cancel_at_period_end = cancel_at_period_end;
        state
            .subscriptions
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }
}

/// An active monthly "Pro" row observed at a fixed time in 2023
pub fn sample_subscription(
    subscription_id: &str,
    user_id: &str,
    customer_id: &str,
    price_id: &str,
) -> NewSubscription {
    let observed_at = OffsetDateTime::from_unix_timestamp(PERIOD_START).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    NewSubscription {
        subscription_id: subscription_id.to_string(),
        user_id: user_id.to_string(),
        customer_id: customer_id.to_string(),
        price_id: price_id.to_string(),
        status: SubscriptionStatus::Active,
        plan_name: "Pro".to_string(),
        billing_cycle: Some(BillingInterval::Month),
        current_period_start: Some(observed_at),
        current_period_end: Some(observed_at + time::Duration::days(PERIOD_DAYS)),
        cancel_at_period_end: false,
        observed_at,
    }
}

/// Stripe-shaped subscription object, as found in `data.object`
pub fn subscription_object(
    subscription_id: &str,
    customer_id: &str,
    price_id: &str,
    status: &str,
) -> Value {
    json!({
        "id": subscription_id,
        "object": "subscription",
        "customer": customer_id,
        "status": status,
        "cancel_at_period_end": false,
        "cancel_at": null,
        "created": PERIOD_START,
        "start_date": PERIOD_START,
        "items": {
            "data": [{
                "id": format!("si_{subscription_id}"),
                "current_period_start": PERIOD_START,
                "current_period_end": PERIOD_START + PERIOD_DAYS * 86_400,
                "price": {
                    "id": price_id,
                    "product": "prod_sample_pro",
                    "unit_amount": 3900,
                    "currency": "usd",
                    "recurring": { "interval": "month" }
                }
            }]
        }
    })
}

/// Stripe-shaped invoice object
pub fn invoice_object(
    invoice_id: &str,
    customer_id: &str,
    subscription_id: Option<&str>,
    amount_due: i64,
) -> Value {
    json!({
        "id": invoice_id,
        "object": "invoice",
        "customer": customer_id,
        "subscription": subscription_id,
        "amount_due": amount_due,
        "amount_paid": amount_due,
        "currency": "usd",
        "status": "paid",
        "invoice_pdf": format!("https://pay.stripe.test/invoice/{invoice_id}/pdf"),
        "hosted_invoice_url": format!("https://invoice.stripe.test/i/{invoice_id}"),
        "created": PERIOD_START,
    })
}

/// Full webhook body wrapping `object`
pub fn event_payload(event_id: &str, event_type: &str, created: i64, object: Value) -> String {
    json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": created,
        "data": { "object": object }
    })
    .to_string()
}
