//! Lexfam billing
//!
//! Accounts, free-tier usage metering, the Stripe subscription mirror and
//! webhook reconciliation. Storage and the payment processor sit behind
//! async traits so the services run against Postgres and Stripe in
//! production and against in-memory doubles in tests.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod checkout;
pub mod client;
pub mod customer;
pub mod entitlement;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod password;
pub mod plans;
pub mod portal;
pub mod postgres;
pub mod stripe_gateway;
pub mod subscriptions;
pub mod usage;
pub mod users;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


use std::sync::Arc;

use sqlx::PgPool;

pub use checkout::{CheckoutParams, CheckoutResponse, CheckoutService};
pub use client::{PriceIds, StripeClient, StripeConfig};
pub use customer::CustomerService;
pub use entitlement::{evaluate, Entitlement, EntitlementService, Tier, UsageWarning};
pub use error::{BillingError, BillingResult, ErrorKind};
pub use gateway::{BillingGateway, InvoiceSnapshot, PriceSnapshot, SubscriptionSnapshot};
pub use memory::MemoryStore;
pub use plans::{plan_catalog, Plan};
pub use portal::{PortalResponse, PortalService};
pub use postgres::PgBillingStore;
pub use stripe_gateway::StripeGateway;
pub use subscriptions::{
    BillingHistoryEntry, ModifyOutcome, PriceCatalog, ReconcileReport, SubscriptionRecord,
    SubscriptionService, SubscriptionStatusView, SubscriptionStore, SubscriptionWithUser,
};
pub use usage::{UsageCheck, UsageCounter, UsageStore};
pub use users::{UserService, UserStore, UserSummary};
pub use webhooks::{
    ReplayReport, StoredEvent, WebhookEvent, WebhookEventStore, WebhookHandler, WebhookOutcome,
};

/// The four storage ports, usually backed by one store
#[derive(Clone)]
pub struct BillingStores {
    pub users: Arc<dyn UserStore>,
    pub usage: Arc<dyn UsageStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub events: Arc<dyn WebhookEventStore>,
}

impl BillingStores {
    pub fn postgres(pool: PgPool) -> Self {
        Self::shared(Arc::new(PgBillingStore::new(pool)))
    }

    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self::shared(store)
    }

    fn shared<S>(store: Arc<S>) -> Self
    where
        S: UserStore + UsageStore + SubscriptionStore + WebhookEventStore + 'static,
    {
        Self {
            users: store.clone(),
            usage: store.clone(),
            subscriptions: store.clone(),
            events: store,
        }
    }
}

/// Settings the services need from the Stripe configuration
#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub price_ids: PriceIds,
    pub webhook_secret: Option<String>,
    pub app_base_url: String,
}

impl From<&StripeConfig> for BillingSettings {
    fn from(config: &StripeConfig) -> Self {
        Self {
            price_ids: config.price_ids.clone(),
            webhook_secret: config.webhook_secret.clone(),
            app_base_url: config.app_base_url.clone(),
        }
    }
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub users: UserService,
    pub usage: UsageCounter,
    pub customers: CustomerService,
    pub checkout: CheckoutService,
    pub portal: PortalService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub entitlements: EntitlementService,
    pub settings: BillingSettings,
}

impl BillingService {
    pub fn new(stores: BillingStores, gateway: Arc<dyn BillingGateway>, settings: BillingSettings) -> Self {
        let customers = CustomerService::new(stores.subscriptions.clone(), gateway.clone());
        let subscriptions = SubscriptionService::new(
            stores.subscriptions.clone(),
            gateway.clone(),
            settings.price_ids.clone(),
        );

        Self {
            users: UserService::new(stores.users.clone()),
            usage: UsageCounter::new(stores.usage.clone()),
            checkout: CheckoutService::new(
                customers.clone(),
                gateway.clone(),
                settings.price_ids.clone(),
                settings.app_base_url.clone(),
            ),
            portal: PortalService::new(
                stores.subscriptions.clone(),
                gateway,
                settings.app_base_url.clone(),
            ),
            webhooks: WebhookHandler::new(
                stores.events.clone(),
                stores.subscriptions.clone(),
                subscriptions.prices().clone(),
                settings.webhook_secret.clone(),
            ),
            entitlements: EntitlementService::new(
                stores.users,
                stores.usage,
                stores.subscriptions,
            ),
            customers,
            subscriptions,
            settings,
        }
    }

    /// Postgres stores and the Stripe gateway, configured from the environment
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let settings = BillingSettings::from(stripe.config());
        Ok(Self::new(
            BillingStores::postgres(pool),
            Arc::new(StripeGateway::new(stripe)),
            settings,
        ))
    }

    pub fn plans(&self) -> Vec<Plan> {
        plan_catalog(&self.settings.price_ids)
    }
}
