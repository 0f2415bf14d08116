//! In-memory implementation of every billing store
//!
//! Backs local development without Postgres and the service tests. It keeps
//! the same guarantees as the Postgres store: atomic counter updates, guarded
//! subscription writes, atomic event claims and the same listing orders.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use lexfam_shared::{BillingInterval, Page, Provider, Role, SubscriptionStatus, User};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{
    InvoiceRecord, InvoiceWithUser, NewSubscription, PriceRecord, SubscriptionRecord,
    SubscriptionStore, SubscriptionUpdate, SubscriptionWithUser, WriteOutcome, LOCAL_CLOCK_SKEW,
};
use crate::usage::UsageStore;
use crate::users::{NewUser, UserStore, UserSummary};
use crate::webhooks::{ClaimResult, ProcessingResult, StoredEvent, WebhookEvent, WebhookEventStore};

struct UserRow {
    user: User,
    seq: u64,
}

struct CustomerRow {
    customer_id: String,
}

struct PriceRow {
    product_id: String,
    unit_amount: i64,
    currency: String,
    interval: BillingInterval,
}

struct SubscriptionRow {
    subscription: NewSubscription,
    last_event_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    seq: u64,
}

#[derive(Default)]
struct State {
    seq: u64,
    users: HashMap<String, UserRow>,
    /// Keyed by user id
    customers: HashMap<String, CustomerRow>,
    /// Product id to name
    products: HashMap<String, String>,
    prices: HashMap<String, PriceRow>,
    subscriptions: HashMap<String, SubscriptionRow>,
    invoices: HashMap<String, InvoiceRecord>,
    events: HashMap<String, StoredEvent>,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn insert_user(&mut self, new: &NewUser) -> BillingResult<User> {
        if self.users.contains_key(&new.identifier) {
            return Err(BillingError::AlreadyExists(format!("user {}", new.identifier)));
        }
        if let Some(email) = &new.email {
            if self.users.values().any(|r| r.user.email.as_ref() == Some(email)) {
                return Err(BillingError::AlreadyExists(format!("email {email}")));
            }
        }

        let user = User {
            identifier: new.identifier.clone(),
            email: new.email.clone(),
            display_name: new.display_name.clone(),
            role: new.role,
            provider: new.provider,
            password_hash: new.password_hash.clone(),
            message_count: 0,
            created_at: OffsetDateTime::now_utc(),
        };
        let seq = self.next_seq();
        self.users.insert(
            user.identifier.clone(),
            UserRow {
                user: user.clone(),
                seq,
            },
        );
        Ok(user)
    }

    fn insert_price(&mut self, price: &PriceRecord) {
        self.products
            .entry(price.product_id.clone())
            .or_insert_with(|| price.product_name.clone());
        self.prices
            .entry(price.price_id.clone())
            .or_insert_with(|| PriceRow {
                product_id: price.product_id.clone(),
                unit_amount: price.unit_amount,
                currency: price.currency.clone(),
                interval: price.interval,
            });
    }

    fn price_record(&self, price_id: &str) -> Option<PriceRecord> {
        let row = self.prices.get(price_id)?;
        Some(PriceRecord {
            price_id: price_id.to_string(),
            product_id: row.product_id.clone(),
            product_name: self.products.get(&row.product_id).cloned().unwrap_or_default(),
            unit_amount: row.unit_amount,
            currency: row.currency.clone(),
            interval: row.interval,
        })
    }

    fn customer_exists(&self, customer_id: &str) -> bool {
        self.customers.values().any(|c| c.customer_id == customer_id)
    }

    fn user_for_customer(&self, customer_id: &str) -> Option<&str> {
        self.customers
            .iter()
            .find(|(_, c)| c.customer_id == customer_id)
            .map(|(user_id, _)| user_id.as_str())
    }

    fn user_email(&self, user_id: &str) -> Option<String> {
        self.users.get(user_id).and_then(|r| r.user.email.clone())
    }

    fn subscription_record(&self, row: &SubscriptionRow) -> SubscriptionRecord {
        let s = &row.subscription;
        let price = self.price_record(&s.price_id);
        SubscriptionRecord {
            subscription_id: s.subscription_id.clone(),
            user_id: s.user_id.clone(),
            customer_id: s.customer_id.clone(),
            price_id: s.price_id.clone(),
            status: s.status,
            plan_name: s.plan_name.clone(),
            billing_cycle: s.billing_cycle,
            current_period_start: s.current_period_start,
            current_period_end: s.current_period_end,
            cancel_at_period_end: s.cancel_at_period_end,
            last_event_at: row.last_event_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            unit_amount: price.as_ref().map(|p| p.unit_amount),
            currency: price.as_ref().map(|p| p.currency.clone()),
            product_name: price.map(|p| p.product_name),
        }
    }

    fn current_subscription(&self, user_id: &str) -> Option<&SubscriptionRow> {
        self.subscriptions
            .values()
            .filter(|r| r.subscription.user_id == user_id && r.subscription.status.is_current())
            .max_by_key(|r| (r.created_at, r.seq))
    }
}

fn is_stale(last_event_at: Option<OffsetDateTime>, observed_at: OffsetDateTime) -> bool {
    last_event_at.is_some_and(|last| last > observed_at)
}

fn paginate<T>(items: Vec<T>, page: Page) -> Vec<T> {
    items
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit as usize)
        .collect()
}

/// Billing stores held in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with the development catalog: "Pro Plan" monthly and yearly
    pub fn with_sample_catalog() -> Self {
        let mut state = State::default();
        for (price_id, unit_amount, interval) in [
            ("price_sample_monthly", 3900, BillingInterval::Month),
            ("price_sample_yearly", 46800, BillingInterval::Year),
        ] {
            state.insert_price(&PriceRecord {
                price_id: price_id.to_string(),
                product_id: "prod_sample_pro".to_string(),
                product_name: "Pro Plan".to_string(),
                unit_amount,
                currency: "usd".to_string(),
                interval,
            });
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// Insert a password-less account; returns the existing one if present
    pub async fn seed_user(&self, identifier: &str, role: Role) -> User {
        let mut state = self.state.write().await;
        if let Some(row) = state.users.get(identifier) {
            return row.user.clone();
        }

        let new = NewUser {
            identifier: identifier.to_string(),
            email: Some(identifier.to_string()),
            display_name: None,
            password_hash: None,
            role,
            provider: Provider::Password,
        };
        match state.insert_user(&new) {
            Ok(user) => user,
            // Only reachable when another user already owns the email
            Err(_) => User {
                identifier: new.identifier,
                email: None,
                display_name: None,
                role,
                provider: Provider::Password,
                password_hash: None,
                message_count: 0,
                created_at: OffsetDateTime::now_utc(),
            },
        }
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, user: &NewUser) -> BillingResult<User> {
        self.state.write().await.insert_user(user)
    }

    async fn get_user(&self, identifier: &str) -> BillingResult<Option<User>> {
        Ok(self
            .state
            .read()
            .await
            .users
            .get(identifier)
            .map(|r| r.user.clone()))
    }

    async fn get_user_by_email(&self, email: &str) -> BillingResult<Option<User>> {
        Ok(self
            .state
            .read()
            .await
            .users
            .values()
            .find(|r| r.user.email.as_deref() == Some(email))
            .map(|r| r.user.clone()))
    }

    async fn set_role(&self, identifier: &str, role: Role) -> BillingResult<bool> {
        let mut state = self.state.write().await;
        Ok(match state.users.get_mut(identifier) {
            Some(row) => {
                row.user.role = role;
                true
            }
            None => false,
        })
    }

    async fn list_users(&self, page: Page) -> BillingResult<Vec<UserSummary>> {
        let state = self.state.read().await;
        let mut rows: Vec<&UserRow> = state.users.values().collect();
        rows.sort_by_key(|r| std::cmp::Reverse((r.user.created_at, r.seq)));

        let summaries = rows
            .into_iter()
            .map(|r| UserSummary {
                identifier: r.user.identifier.clone(),
                email: r.user.email.clone(),
                role: r.user.role,
                provider: r.user.provider,
                created_at: r.user.created_at,
                subscription_status: state
                    .current_subscription(&r.user.identifier)
                    .map(|s| s.subscription.status),
            })
            .collect();
        Ok(paginate(summaries, page))
    }

    async fn count_users(&self) -> BillingResult<i64> {
        Ok(self.state.read().await.users.len() as i64)
    }

    async fn ping(&self) -> BillingResult<()> {
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn get_count(&self, user_id: &str) -> BillingResult<i64> {
        Ok(self
            .state
            .read()
            .await
            .users
            .get(user_id)
            .map_or(0, |r| r.user.message_count))
    }

    async fn increment(&self, user_id: &str) -> BillingResult<i64> {
        let mut state = self.state.write().await;
        Ok(match state.users.get_mut(user_id) {
            Some(row) => {
                row.user.message_count += 1;
                row.user.message_count
            }
            None => 0,
        })
    }

    async fn reset(&self, user_id: &str) -> BillingResult<bool> {
        let mut state = self.state.write().await;
        Ok(match state.users.get_mut(user_id) {
            Some(row) => {
                row.user.message_count = 0;
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get_customer_id(&self, user_id: &str) -> BillingResult<Option<String>> {
        Ok(self
            .state
            .read()
            .await
            .customers
            .get(user_id)
            .map(|c| c.customer_id.clone()))
    }

    async fn upsert_customer(
        &self,
        user_id: &str,
        customer_id: &str,
        _email: Option<&str>,
        _name: Option<&str>,
    ) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(user_id) {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }
        if state
            .user_for_customer(customer_id)
            .is_some_and(|owner| owner != user_id)
        {
            return Err(BillingError::AlreadyExists(format!("customer {customer_id}")));
        }

        state.customers.insert(
            user_id.to_string(),
            CustomerRow {
                customer_id: customer_id.to_string(),
            },
        );
        Ok(())
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<String>> {
        Ok(self
            .state
            .read()
            .await
            .user_for_customer(customer_id)
            .map(str::to_string))
    }

    async fn get_price(&self, price_id: &str) -> BillingResult<Option<PriceRecord>> {
        Ok(self.state.read().await.price_record(price_id))
    }

    async fn insert_price(&self, price: &PriceRecord) -> BillingResult<()> {
        self.state.write().await.insert_price(price);
        Ok(())
    }

    async fn get_current_subscription(
        &self,
        user_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let state = self.state.read().await;
        Ok(state
            .current_subscription(user_id)
            .map(|row| state.subscription_record(row)))
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .get(subscription_id)
            .map(|row| state.subscription_record(row)))
    }

    async fn upsert_subscription(&self, new: &NewSubscription) -> BillingResult<WriteOutcome> {
        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();

        if let Some(row) = state.subscriptions.get_mut(&new.subscription_id) {
            if is_stale(row.last_event_at, new.observed_at) {
                return Ok(WriteOutcome::Stale);
            }
            let s = &mut row.subscription;
            s.status = new.status;
            s.plan_name = new.plan_name.clone();
            s.billing_cycle = new.billing_cycle;
            s.current_period_start = new.current_period_start;
            s.current_period_end = new.current_period_end;
            row.last_event_at = Some(new.observed_at);
            row.updated_at = now;
            return Ok(WriteOutcome::Applied);
        }

        if !state.users.contains_key(&new.user_id)
            || !state.customer_exists(&new.customer_id)
            || !state.prices.contains_key(&new.price_id)
        {
            return Err(BillingError::Database(format!(
                "subscription {} references a missing user, customer or price",
                new.subscription_id
            )));
        }

        let seq = state.next_seq();
        state.subscriptions.insert(
            new.subscription_id.clone(),
            SubscriptionRow {
                subscription: new.clone(),
                last_event_at: Some(new.observed_at),
                created_at: now,
                updated_at: now,
                seq,
            },
        );
        Ok(WriteOutcome::Applied)
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> BillingResult<WriteOutcome> {
        let mut state = self.state.write().await;
        if let Some(price_id) = &update.price_id {
            if !state.prices.contains_key(price_id) {
                return Err(BillingError::Database(format!("unknown price {price_id}")));
            }
        }

        let Some(row) = state.subscriptions.get_mut(subscription_id) else {
            return Ok(WriteOutcome::Missing);
        };
        if is_stale(row.last_event_at, update.observed_at) {
            return Ok(WriteOutcome::Stale);
        }

        let s = &mut row.subscription;
        if let Some(status) = update.status {
            s.status = status;
        }
        if let Some(start) = update.current_period_start {
            s.current_period_start = Some(start);
        }
        if let Some(end) = update.current_period_end {
            s.current_period_end = Some(end);
        }
        if let Some(cancel) = update.cancel_at_period_end {
            s.cancel_at_period_end = cancel;
        }
        if let Some(price_id) = &update.price_id {
            s.price_id = price_id.clone();
        }
        if let Some(cycle) = update.billing_cycle {
            s.billing_cycle = Some(cycle);
        }
        row.last_event_at = Some(update.observed_at);
        row.updated_at = OffsetDateTime::now_utc();
        Ok(WriteOutcome::Applied)
    }

    async fn mark_cancel_at_period_end(&self, user_id: &str, cancel: bool) -> BillingResult<bool> {
        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();

        let target = state
            .subscriptions
            .values()
            .filter(|r| {
                r.subscription.user_id == user_id && r.subscription.status.grants_paid_access()
            })
            .max_by_key(|r| (r.created_at, r.seq))
            .map(|r| r.subscription.subscription_id.clone());

        let Some(row) = target.and_then(|id| state.subscriptions.get_mut(&id)) else {
            return Ok(false);
        };
        let observed_at = now - LOCAL_CLOCK_SKEW;
        row.subscription.cancel_at_period_end = cancel;
        row.last_event_at = Some(row.last_event_at.map_or(observed_at, |last| last.max(observed_at)));
        row.updated_at = now;
        Ok(true)
    }

    async fn list_current_subscription_users(&self) -> BillingResult<Vec<String>> {
        let state = self.state.read().await;
        let mut users: Vec<String> = state
            .subscriptions
            .values()
            .filter(|r| r.subscription.status.is_current())
            .map(|r| r.subscription.user_id.clone())
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    async fn list_subscriptions(&self, page: Page) -> BillingResult<Vec<SubscriptionWithUser>> {
        let state = self.state.read().await;
        let mut rows: Vec<&SubscriptionRow> = state.subscriptions.values().collect();
        rows.sort_by_key(|r| std::cmp::Reverse((r.created_at, r.seq)));

        let listed = rows
            .into_iter()
            .map(|row| SubscriptionWithUser {
                user_email: state.user_email(&row.subscription.user_id),
                subscription: state.subscription_record(row),
            })
            .collect();
        Ok(paginate(listed, page))
    }

    async fn upsert_invoice(&self, invoice: &InvoiceRecord) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if !state.customer_exists(&invoice.customer_id) {
            return Err(BillingError::Database(format!(
                "invoice {} references unknown customer {}",
                invoice.invoice_id, invoice.customer_id
            )));
        }
        if let Some(subscription_id) = &invoice.subscription_id {
            if !state.subscriptions.contains_key(subscription_id) {
                return Err(BillingError::Database(format!(
                    "invoice {} references unknown subscription {subscription_id}",
                    invoice.invoice_id
                )));
            }
        }

        match state.invoices.get_mut(&invoice.invoice_id) {
            Some(existing) => {
                existing.amount_due = invoice.amount_due;
                existing.amount_paid = invoice.amount_paid;
                existing.status = invoice.status.clone();
                existing.invoice_pdf = invoice.invoice_pdf.clone().or(existing.invoice_pdf.take());
                existing.hosted_invoice_url = invoice
                    .hosted_invoice_url
                    .clone()
                    .or(existing.hosted_invoice_url.take());
                if invoice.subscription_id.is_some() {
                    existing.subscription_id = invoice.subscription_id.clone();
                }
            }
            None => {
                state.invoices.insert(invoice.invoice_id.clone(), invoice.clone());
            }
        }
        Ok(())
    }

    async fn list_invoices_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<InvoiceRecord>> {
        let state = self.state.read().await;
        let Some(customer) = state.customers.get(user_id) else {
            return Ok(Vec::new());
        };

        let mut invoices: Vec<InvoiceRecord> = state
            .invoices
            .values()
            .filter(|i| i.customer_id == customer.customer_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| std::cmp::Reverse(i.created_at));
        invoices.truncate(limit.max(0) as usize);
        Ok(invoices)
    }

    async fn list_invoices(&self, page: Page) -> BillingResult<Vec<InvoiceWithUser>> {
        let state = self.state.read().await;
        let mut invoices: Vec<&InvoiceRecord> = state.invoices.values().collect();
        invoices.sort_by_key(|i| std::cmp::Reverse(i.created_at));

        let listed = invoices
            .into_iter()
            .map(|invoice| InvoiceWithUser {
                user_email: state
                    .user_for_customer(&invoice.customer_id)
                    .and_then(|user_id| state.user_email(user_id)),
                invoice: invoice.clone(),
            })
            .collect();
        Ok(paginate(listed, page))
    }
}

#[async_trait]
impl WebhookEventStore for MemoryStore {
    async fn claim_event(
        &self,
        event: &WebhookEvent,
        stale_after: Duration,
    ) -> BillingResult<ClaimResult> {
        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();

        if let Some(stored) = state.events.get_mut(&event.id) {
            let abandoned = stored.result == ProcessingResult::Processing
                && stored.processing_started_at + stale_after < now;

            if stored.result.is_reclaimable() || abandoned {
                stored.result = ProcessingResult::Processing;
                stored.attempts += 1;
                stored.processing_started_at = now;
                stored.error_message = None;
                stored.processed_at = None;
                return Ok(ClaimResult::Claimed);
            }

            return Ok(match stored.result {
                ProcessingResult::Processing => ClaimResult::InFlight,
                other => ClaimResult::AlreadyProcessed(other),
            });
        }

        state.events.insert(
            event.id.clone(),
            StoredEvent {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                payload: event.payload.clone(),
                event_created_at: event.created_at(),
                result: ProcessingResult::Processing,
                error_message: None,
                attempts: 1,
                processing_started_at: now,
                processed_at: None,
                created_at: now,
            },
        );
        Ok(ClaimResult::Claimed)
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if let Some(stored) = state.events.get_mut(event_id) {
            stored.result = result;
            stored.error_message = error_message.map(str::to_string);
            stored.processed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<StoredEvent>> {
        Ok(self.state.read().await.events.get(event_id).cloned())
    }

    async fn list_events(
        &self,
        results: &[ProcessingResult],
        started_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<StoredEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<StoredEvent> = state
            .events
            .values()
            .filter(|e| results.contains(&e.result) && e.processing_started_at <= started_before)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.processing_started_at);
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }
}
