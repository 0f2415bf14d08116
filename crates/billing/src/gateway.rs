//! Billing gateway port and the normalized views of remote billing objects
//!
//! Services talk to the payment processor only through [`BillingGateway`].
//! Every object that crosses the seam, whether returned by an API call or
//! carried in a webhook payload, is normalized by the same parsers here so
//! the two paths cannot disagree on defaults or fallbacks.

use async_trait::async_trait;
use lexfam_shared::{BillingInterval, SubscriptionStatus};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Parameters for a hosted subscription checkout
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub user_id: String,
    /// Coupon to attach; promotion codes are allowed when absent
    pub coupon_id: Option<String>,
}

/// Parameters for moving a subscription onto another price
#[derive(Debug, Clone, PartialEq)]
pub struct PriceChange {
    pub subscription_id: String,
    pub item_id: String,
    pub new_price_id: String,
    /// Keep the current billing anchor (same-interval moves)
    pub keep_billing_anchor: bool,
}

/// Port over the payment processor
#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// False when the customer is unknown remotely or was deleted
    async fn customer_exists(&self, customer_id: &str) -> BillingResult<bool>;

    async fn create_customer(
        &self,
        user_id: &str,
        email: &str,
        name: Option<&str>,
    ) -> BillingResult<String>;

    /// One-time percentage coupon, returns the coupon id
    async fn create_coupon(&self, percent_off: f64, name: &str) -> BillingResult<String>;

    /// Returns the hosted checkout URL
    async fn create_checkout_session(&self, request: &CheckoutRequest) -> BillingResult<String>;

    /// Returns the hosted portal URL
    async fn create_portal_session(&self, customer_id: &str, return_url: &str)
        -> BillingResult<String>;

    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<SubscriptionSnapshot>;

    /// Price with its product expanded
    async fn retrieve_price(&self, price_id: &str) -> BillingResult<PriceSnapshot>;

    /// Prorates with an immediate invoice
    async fn change_subscription_price(&self, change: &PriceChange)
        -> BillingResult<SubscriptionSnapshot>;

    /// Negative `amount` credits the customer's next invoice
    async fn create_invoice_item(
        &self,
        customer_id: &str,
        amount: i64,
        currency: &str,
        description: &str,
    ) -> BillingResult<()>;

    async fn cancel_subscription_now(&self, subscription_id: &str)
        -> BillingResult<SubscriptionSnapshot>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<SubscriptionSnapshot>;
}

// =============================================================================
// Snapshots
// =============================================================================

/// Normalized remote subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    /// Scheduled cancellation time, set by some portal flows instead of the flag
    pub cancel_at: Option<i64>,
    /// Period start, already resolved through the item and start-date fallbacks
    pub current_period_start: Option<i64>,
    /// Period end, already resolved through the item fallback
    pub current_period_end: Option<i64>,
    pub created: Option<i64>,
    /// First line item, used for price changes
    pub item_id: Option<String>,
    pub price: Option<PriceSnapshot>,
}

impl SubscriptionSnapshot {
    pub fn from_value(value: &Value) -> BillingResult<Self> {
        let id = str_field(value, "id")
            .ok_or_else(|| BillingError::MalformedPayload("subscription without id".to_string()))?;
        let status = str_field(value, "status")
            .ok_or_else(|| BillingError::MalformedPayload(format!("subscription {id} without status")))?
            .parse::<SubscriptionStatus>()?;

        let item = &value["items"]["data"][0];

        let current_period_start = value["current_period_start"]
            .as_i64()
            .or_else(|| item["current_period_start"].as_i64())
            .or_else(|| value["start_date"].as_i64());
        let current_period_end = value["current_period_end"]
            .as_i64()
            .or_else(|| item["current_period_end"].as_i64());

        let price = match &item["price"] {
            Value::Null => None,
            Value::String(price_id) => Some(PriceSnapshot::bare(price_id)),
            price => Some(PriceSnapshot::from_value(price)?),
        };

        Ok(Self {
            id,
            customer_id: expandable_id(&value["customer"]),
            status,
            cancel_at_period_end: value["cancel_at_period_end"].as_bool().unwrap_or(false),
            cancel_at: value["cancel_at"].as_i64(),
            current_period_start,
            current_period_end,
            created: value["created"].as_i64(),
            item_id: str_field(item, "id"),
            price,
        })
    }

    /// A scheduled `cancel_at` counts as cancelling at period end
    pub fn effective_cancel_at_period_end(&self) -> bool {
        self.cancel_at_period_end || self.cancel_at.is_some()
    }

    pub fn price_id(&self) -> Option<&str> {
        self.price.as_ref().map(|p| p.id.as_str())
    }

    pub fn period_start(&self) -> Option<OffsetDateTime> {
        self.current_period_start.and_then(unix_to_datetime)
    }

    pub fn period_end(&self) -> Option<OffsetDateTime> {
        self.current_period_end.and_then(unix_to_datetime)
    }
}

/// Normalized remote price, product name included when expanded
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSnapshot {
    pub id: String,
    pub product_id: Option<String>,
    pub product_name: Option<String>,
    pub unit_amount: Option<i64>,
    pub currency: Option<String>,
    pub interval: Option<BillingInterval>,
}

impl PriceSnapshot {
    fn bare(id: &str) -> Self {
        Self {
            id: id.to_string(),
            product_id: None,
            product_name: None,
            unit_amount: None,
            currency: None,
            interval: None,
        }
    }

    pub fn from_value(value: &Value) -> BillingResult<Self> {
        let id = str_field(value, "id")
            .ok_or_else(|| BillingError::MalformedPayload("price without id".to_string()))?;

        let product = &value["product"];
        let product_name = match product {
            Value::Object(_) => str_field(product, "name"),
            _ => None,
        };

        Ok(Self {
            id,
            product_id: expandable_id(product),
            product_name,
            unit_amount: value["unit_amount"].as_i64(),
            currency: str_field(value, "currency"),
            interval: value["recurring"]["interval"]
                .as_str()
                .and_then(|i| i.parse::<BillingInterval>().ok()),
        })
    }
}

/// Normalized remote invoice
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceSnapshot {
    pub id: String,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub amount_due: i64,
    pub amount_paid: Option<i64>,
    pub currency: String,
    pub status: Option<String>,
    pub invoice_pdf: Option<String>,
    pub hosted_invoice_url: Option<String>,
    pub created: Option<i64>,
}

impl InvoiceSnapshot {
    pub fn from_value(value: &Value) -> BillingResult<Self> {
        let id = str_field(value, "id")
            .ok_or_else(|| BillingError::MalformedPayload("invoice without id".to_string()))?;
        let customer_id = expandable_id(&value["customer"])
            .ok_or_else(|| BillingError::MalformedPayload(format!("invoice {id} without customer")))?;

        Ok(Self {
            id,
            customer_id,
            subscription_id: expandable_id(&value["subscription"]),
            amount_due: value["amount_due"].as_i64().unwrap_or(0),
            amount_paid: value["amount_paid"].as_i64(),
            currency: str_field(value, "currency").unwrap_or_else(|| "usd".to_string()),
            status: str_field(value, "status"),
            invoice_pdf: str_field(value, "invoice_pdf"),
            hosted_invoice_url: str_field(value, "hosted_invoice_url"),
            created: value["created"].as_i64(),
        })
    }
}

/// Id of a field that is either a plain id or an expanded object
pub fn expandable_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(_) => str_field(value, "id"),
        _ => None,
    }
}

pub fn unix_to_datetime(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
