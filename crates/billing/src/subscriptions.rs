//! Local subscription mirror and the operations that keep it in step with Stripe

use std::sync::Arc;

use async_trait::async_trait;
use lexfam_shared::{BillingInterval, Page, SubscriptionStatus};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::client::PriceIds;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{BillingGateway, PriceChange, PriceSnapshot, SubscriptionSnapshot};
use crate::plans::{upgrade_credit, UPGRADE_CREDIT_DESCRIPTION};

/// Plan name recorded for webhook-created subscriptions
pub const DEFAULT_PLAN_NAME: &str = "Pro";
/// Product name used when Stripe does not report one
pub const DEFAULT_PRODUCT_NAME: &str = "Pro Plan";
/// How far this host's clock may run ahead of Stripe's
pub const LOCAL_CLOCK_SKEW: time::Duration = time::Duration::seconds(60);

/// Observation time for a write made here rather than by a Stripe event.
///
/// Held back by [`LOCAL_CLOCK_SKEW`] so events Stripe creates just after the
/// write still apply, but never earlier than what the row has already seen.
pub fn local_observation(record: &SubscriptionRecord) -> OffsetDateTime {
    let held_back = OffsetDateTime::now_utc() - LOCAL_CLOCK_SKEW;
    record.last_event_at.map_or(held_back, |last| last.max(held_back))
}

// =============================================================================
// Records
// =============================================================================

/// A locally known price, joined with its product
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRecord {
    pub price_id: String,
    pub product_id: String,
    pub product_name: String,
    pub unit_amount: i64,
    pub currency: String,
    pub interval: BillingInterval,
}

impl PriceRecord {
    /// Apply the defaults used when auto-creating a price from Stripe data
    pub fn from_snapshot(snapshot: &PriceSnapshot) -> BillingResult<Self> {
        let product_id = snapshot.product_id.clone().ok_or_else(|| {
            BillingError::MalformedPayload(format!("price {} has no product", snapshot.id))
        })?;

        Ok(Self {
            price_id: snapshot.id.clone(),
            product_id,
            product_name: snapshot
                .product_name
                .clone()
                .unwrap_or_else(|| DEFAULT_PRODUCT_NAME.to_string()),
            unit_amount: snapshot.unit_amount.unwrap_or(0),
            currency: snapshot.currency.clone().unwrap_or_else(|| "usd".to_string()),
            interval: snapshot.interval.unwrap_or_default(),
        })
    }
}

/// A mirrored subscription with its price details
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRecord {
    pub subscription_id: String,
    pub user_id: String,
    pub customer_id: String,
    pub price_id: String,
    pub status: SubscriptionStatus,
    pub plan_name: String,
    pub billing_cycle: Option<BillingInterval>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub last_event_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub unit_amount: Option<i64>,
    pub currency: Option<String>,
    pub product_name: Option<String>,
}

/// Subscription row for admin listings
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionWithUser {
    pub user_email: Option<String>,
    pub subscription: SubscriptionRecord,
}

/// Full row written by an upsert
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscription {
    pub subscription_id: String,
    pub user_id: String,
    pub customer_id: String,
    pub price_id: String,
    pub status: SubscriptionStatus,
    pub plan_name: String,
    pub billing_cycle: Option<BillingInterval>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// Time of the remote observation this row reflects
    pub observed_at: OffsetDateTime,
}

/// Partial update; `None` fields are left untouched
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpdate {
    pub status: Option<SubscriptionStatus>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
    pub price_id: Option<String>,
    pub billing_cycle: Option<BillingInterval>,
    /// Rows already holding a newer observation are not modified
    pub observed_at: OffsetDateTime,
}

impl SubscriptionUpdate {
    pub fn observed_at(observed_at: OffsetDateTime) -> Self {
        Self {
            status: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: None,
            price_id: None,
            billing_cycle: None,
            observed_at,
        }
    }

    /// Status, period bounds and cancel flag from an authoritative snapshot
    pub fn from_snapshot(snapshot: &SubscriptionSnapshot, observed_at: OffsetDateTime) -> Self {
        Self {
            status: Some(snapshot.status),
            current_period_start: snapshot.period_start(),
            current_period_end: snapshot.period_end(),
            cancel_at_period_end: Some(snapshot.effective_cancel_at_period_end()),
            ..Self::observed_at(observed_at)
        }
    }

    pub fn status(mut self, status: SubscriptionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn cancel_at_period_end(mut self, cancel: bool) -> Self {
        self.cancel_at_period_end = Some(cancel);
        self
    }
}

/// Result of a guarded subscription write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The row already reflects a newer observation
    Stale,
    Missing,
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}

/// A mirrored invoice
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRecord {
    pub invoice_id: String,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub amount_due: i64,
    pub amount_paid: i64,
    pub currency: String,
    pub status: String,
    pub invoice_pdf: Option<String>,
    pub hosted_invoice_url: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Invoice row for admin listings
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceWithUser {
    pub user_email: Option<String>,
    pub invoice: InvoiceRecord,
}

// =============================================================================
// Store port
// =============================================================================

/// Persistence port for customers, prices, subscriptions and invoices
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_customer_id(&self, user_id: &str) -> BillingResult<Option<String>>;

    /// Insert or replace the user's customer mapping
    async fn upsert_customer(
        &self,
        user_id: &str,
        customer_id: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) -> BillingResult<()>;

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<String>>;

    async fn get_price(&self, price_id: &str) -> BillingResult<Option<PriceRecord>>;

    /// Insert product and price; existing rows are kept as they are
    async fn insert_price(&self, price: &PriceRecord) -> BillingResult<()>;

    /// Most recent subscription with status active, trialing or past_due
    async fn get_current_subscription(&self, user_id: &str)
        -> BillingResult<Option<SubscriptionRecord>>;

    async fn get_subscription(&self, subscription_id: &str)
        -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert, or overwrite status, plan, cycle and period bounds of an existing row
    async fn upsert_subscription(&self, subscription: &NewSubscription) -> BillingResult<WriteOutcome>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> BillingResult<WriteOutcome>;

    /// Applies to the user's current active or trialing subscription only
    async fn mark_cancel_at_period_end(&self, user_id: &str, cancel: bool) -> BillingResult<bool>;

    /// Users holding a current subscription, for reconciliation sweeps
    async fn list_current_subscription_users(&self) -> BillingResult<Vec<String>>;

    async fn list_subscriptions(&self, page: Page) -> BillingResult<Vec<SubscriptionWithUser>>;

    async fn upsert_invoice(&self, invoice: &InvoiceRecord) -> BillingResult<()>;

    /// Newest first
    async fn list_invoices_for_user(&self, user_id: &str, limit: i64)
        -> BillingResult<Vec<InvoiceRecord>>;

    async fn list_invoices(&self, page: Page) -> BillingResult<Vec<InvoiceWithUser>>;
}

// =============================================================================
// Price catalog
// =============================================================================

/// Resolves prices locally, creating them from Stripe on first sight
#[derive(Clone)]
pub struct PriceCatalog {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn BillingGateway>,
}

impl PriceCatalog {
    pub fn new(store: Arc<dyn SubscriptionStore>, gateway: Arc<dyn BillingGateway>) -> Self {
        Self { store, gateway }
    }

    pub async fn get_or_create_price(&self, price_id: &str) -> BillingResult<PriceRecord> {
        if let Some(price) = self.store.get_price(price_id).await? {
            return Ok(price);
        }

        let remote = self.gateway.retrieve_price(price_id).await?;
        let record = PriceRecord::from_snapshot(&remote)?;
        self.store.insert_price(&record).await?;

        tracing::info!(
            price_id = %price_id,
            product_id = %record.product_id,
            "Created local price from Stripe"
        );

        // Re-read so a concurrent insert wins consistently
        self.store
            .get_price(price_id)
            .await?
            .ok_or_else(|| BillingError::Internal(format!("price {price_id} vanished after insert")))
    }
}

// =============================================================================
// Views
// =============================================================================

/// Subscription summary shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStatusView {
    pub status: String,
    pub plan: String,
    pub billing_cycle: Option<BillingInterval>,
    pub current_period_end: Option<String>,
    pub cancel_at_period_end: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

impl SubscriptionStatusView {
    pub fn free() -> Self {
        Self {
            status: "free".to_string(),
            plan: "Free".to_string(),
            billing_cycle: None,
            current_period_end: None,
            cancel_at_period_end: false,
            amount: None,
            currency: None,
        }
    }

    fn from_record(record: &SubscriptionRecord) -> Self {
        Self {
            status: record.status.to_string(),
            plan: record.plan_name.clone(),
            billing_cycle: record.billing_cycle,
            current_period_end: record.current_period_end.and_then(format_timestamp),
            cancel_at_period_end: record.cancel_at_period_end,
            amount: record.unit_amount.map(minor_to_major),
            currency: record.currency.clone(),
        }
    }
}

/// Result of a plan change request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModifyOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_checkout: Option<bool>,
}

/// One invoice in the user's billing history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingHistoryEntry {
    pub id: String,
    pub amount: f64,
    pub currency: String,
    pub status: String,
    pub date: Option<String>,
    pub invoice_pdf: Option<String>,
    pub hosted_invoice_url: Option<String>,
}

impl From<&InvoiceRecord> for BillingHistoryEntry {
    fn from(invoice: &InvoiceRecord) -> Self {
        Self {
            id: invoice.invoice_id.clone(),
            amount: minor_to_major(invoice.amount_due),
            currency: invoice.currency.clone(),
            status: invoice.status.clone(),
            date: format_timestamp(invoice.created_at),
            invoice_pdf: invoice.invoice_pdf.clone(),
            hosted_invoice_url: invoice.hosted_invoice_url.clone(),
        }
    }
}

/// Summary of a reconciliation sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub synced: usize,
    pub failed: usize,
}

pub fn format_timestamp(ts: OffsetDateTime) -> Option<String> {
    ts.format(&Rfc3339).ok()
}

fn minor_to_major(amount: i64) -> f64 {
    amount as f64 / 100.0
}

// =============================================================================
// Service
// =============================================================================

/// Subscription operations exposed to the HTTP layer and the worker
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn BillingGateway>,
    prices: PriceCatalog,
    price_ids: PriceIds,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn BillingGateway>,
        price_ids: PriceIds,
    ) -> Self {
        let prices = PriceCatalog::new(store.clone(), gateway.clone());
        Self {
            store,
            gateway,
            prices,
            price_ids,
        }
    }

    pub fn prices(&self) -> &PriceCatalog {
        &self.prices
    }

    pub async fn current(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.get_current_subscription(user_id).await
    }

    pub async fn status(&self, user_id: &str) -> BillingResult<SubscriptionStatusView> {
        Ok(match self.store.get_current_subscription(user_id).await? {
            Some(record) => SubscriptionStatusView::from_record(&record),
            None => SubscriptionStatusView::free(),
        })
    }

    /// Cancel the user's current subscription
    pub async fn cancel(&self, user_id: &str, immediate: bool) -> BillingResult<()> {
        let subscription = self
            .store
            .get_current_subscription(user_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        if immediate {
            return self.cancel_now(&subscription).await;
        }

        self.gateway
            .set_cancel_at_period_end(&subscription.subscription_id, true)
            .await?;
        // By id: a past_due subscription is current too
        let update = SubscriptionUpdate::observed_at(local_observation(&subscription))
            .cancel_at_period_end(true);
        let outcome = self
            .store
            .update_subscription(&subscription.subscription_id, &update)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.subscription_id,
            outcome = ?outcome,
            "Subscription set to cancel at period end"
        );
        Ok(())
    }

    /// Admin cancellation by subscription id
    pub async fn cancel_by_id(&self, subscription_id: &str, immediate: bool) -> BillingResult<()> {
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        if immediate {
            return self.cancel_now(&subscription).await;
        }

        self.gateway.set_cancel_at_period_end(subscription_id, true).await?;
        let update = SubscriptionUpdate::observed_at(local_observation(&subscription))
            .cancel_at_period_end(true);
        self.store.update_subscription(subscription_id, &update).await?;

        tracing::info!(subscription_id = %subscription_id, "Admin scheduled cancellation");
        Ok(())
    }

    async fn cancel_now(&self, subscription: &SubscriptionRecord) -> BillingResult<()> {
        self.gateway
            .cancel_subscription_now(&subscription.subscription_id)
            .await?;

        let update = SubscriptionUpdate::observed_at(local_observation(subscription))
            .status(SubscriptionStatus::Canceled)
            .cancel_at_period_end(false);
        self.store
            .update_subscription(&subscription.subscription_id, &update)
            .await?;

        tracing::info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.subscription_id,
            "Subscription canceled immediately"
        );
        Ok(())
    }

    /// Move the user's current subscription to another catalog price
    pub async fn modify(
        &self,
        user_id: &str,
        new_price_id: &str,
        apply_discount: bool,
    ) -> BillingResult<ModifyOutcome> {
        if !self.price_ids.contains(new_price_id) {
            return Err(BillingError::InvalidInput(format!("Unknown price: {new_price_id}")));
        }

        let Some(subscription) = self.store.get_current_subscription(user_id).await? else {
            return Ok(ModifyOutcome {
                success: false,
                message: "Please use the checkout flow for new subscriptions".to_string(),
                subscription_id: None,
                requires_checkout: Some(true),
            });
        };

        if subscription.price_id == new_price_id {
            return Ok(ModifyOutcome {
                success: true,
                message: "Already on the selected plan".to_string(),
                subscription_id: Some(subscription.subscription_id),
                requires_checkout: None,
            });
        }

        let remote = self
            .gateway
            .retrieve_subscription(&subscription.subscription_id)
            .await?;
        let item_id = remote.item_id.clone().ok_or_else(|| {
            BillingError::MalformedPayload(format!(
                "subscription {} has no items",
                subscription.subscription_id
            ))
        })?;

        let new_price = self.prices.get_or_create_price(new_price_id).await?;
        let current_interval = match remote.price.as_ref().and_then(|p| p.interval) {
            Some(interval) => Some(interval),
            None => self
                .store
                .get_price(&subscription.price_id)
                .await?
                .map(|p| p.interval),
        };

        let updated = self
            .gateway
            .change_subscription_price(&PriceChange {
                subscription_id: subscription.subscription_id.clone(),
                item_id,
                new_price_id: new_price_id.to_string(),
                keep_billing_anchor: current_interval == Some(new_price.interval),
            })
            .await?;

        if apply_discount {
            let credit = upgrade_credit(new_price.unit_amount);
            if credit != 0 {
                if let Err(e) = self
                    .gateway
                    .create_invoice_item(
                        &subscription.customer_id,
                        credit,
                        &new_price.currency,
                        UPGRADE_CREDIT_DESCRIPTION,
                    )
                    .await
                {
                    tracing::warn!(
                        user_id = %user_id,
                        error = %e,
                        "Failed to apply upgrade discount, continuing without it"
                    );
                }
            }
        }

        let mut update = SubscriptionUpdate::from_snapshot(&updated, local_observation(&subscription));
        update.price_id = Some(new_price_id.to_string());
        update.billing_cycle = Some(new_price.interval);
        self.store
            .update_subscription(&subscription.subscription_id, &update)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.subscription_id,
            from_price = %subscription.price_id,
            to_price = %new_price_id,
            "Subscription plan changed"
        );

        Ok(ModifyOutcome {
            success: true,
            message: "Subscription updated successfully".to_string(),
            subscription_id: Some(subscription.subscription_id),
            requires_checkout: None,
        })
    }

    /// Overwrite local state with Stripe's snapshot; false when there is nothing to sync
    pub async fn sync_from_remote(&self, user_id: &str) -> BillingResult<bool> {
        let Some(subscription) = self.store.get_current_subscription(user_id).await? else {
            return Ok(false);
        };

        let snapshot = self
            .gateway
            .retrieve_subscription(&subscription.subscription_id)
            .await?;
        let update = SubscriptionUpdate::from_snapshot(&snapshot, local_observation(&subscription));
        let outcome = self
            .store
            .update_subscription(&subscription.subscription_id, &update)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.subscription_id,
            status = %snapshot.status,
            outcome = ?outcome,
            "Synced subscription from Stripe"
        );
        Ok(true)
    }

    /// Sync every user with a current subscription, continuing past failures
    pub async fn reconcile_all(&self) -> BillingResult<ReconcileReport> {
        let users = self.store.list_current_subscription_users().await?;
        let mut report = ReconcileReport::default();

        for user_id in users {
            match self.sync_from_remote(&user_id).await {
                Ok(_) => report.synced += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(user_id = %user_id, error = %e, "Reconciliation failed for user");
                }
            }
        }

        Ok(report)
    }

    pub async fn billing_history(
        &self,
        user_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<BillingHistoryEntry>> {
        let invoices = self
            .store
            .list_invoices_for_user(user_id, limit.clamp(1, 100))
            .await?;
        Ok(invoices.iter().map(BillingHistoryEntry::from).collect())
    }

    pub async fn list_subscriptions(&self, page: Page) -> BillingResult<Vec<SubscriptionWithUser>> {
        self.store.list_subscriptions(page).await
    }

    pub async fn list_invoices(&self, page: Page) -> BillingResult<Vec<InvoiceWithUser>> {
        self.store.list_invoices(page).await
    }

    pub async fn invoices_for_user(&self, user_id: &str, limit: i64) -> BillingResult<Vec<InvoiceRecord>> {
        self.store.list_invoices_for_user(user_id, limit.clamp(1, 100)).await
    }
}
