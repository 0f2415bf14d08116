//! Shared types for admin routes
//!
//! Response rows for the admin console. Timestamps are RFC 3339 strings and
//! money stays in minor units, as stored.

use lexfam_billing::subscriptions::{
    format_timestamp, InvoiceRecord, InvoiceWithUser, SubscriptionRecord, SubscriptionWithUser,
};
use lexfam_billing::UserSummary;
use lexfam_shared::{Page, Provider, Role, SubscriptionStatus};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl PageQuery {
    pub fn page(&self) -> Page {
        Page::new(self.page.unwrap_or(1), self.limit.unwrap_or(DEFAULT_PAGE_SIZE))
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AdminUser {
    pub id: String,
    pub identifier: String,
    pub email: Option<String>,
    pub role: Role,
    pub provider: Provider,
    pub created_at: Option<String>,
    pub subscription_status: Option<SubscriptionStatus>,
}

impl From<UserSummary> for AdminUser {
    fn from(user: UserSummary) -> Self {
        Self {
            id: user.identifier.clone(),
            identifier: user.identifier,
            email: user.email,
            role: user.role,
            provider: user.provider,
            created_at: format_timestamp(user.created_at),
            subscription_status: user.subscription_status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AdminUsersResponse {
    pub users: Vec<AdminUser>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Serialize)]
pub struct AdminSubscription {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    pub plan_name: String,
    pub status: SubscriptionStatus,
    pub billing_cycle: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub current_period_start: Option<String>,
    pub current_period_end: Option<String>,
    pub cancel_at_period_end: bool,
    pub created_at: Option<String>,
}

impl AdminSubscription {
    pub fn new(record: SubscriptionRecord, user_email: Option<String>) -> Self {
        Self {
            id: record.subscription_id,
            user_id: record.user_id,
            user_email,
            plan_name: record.product_name.unwrap_or(record.plan_name),
            status: record.status,
            billing_cycle: record.billing_cycle.map(|c| c.as_str().to_string()),
            amount_cents: record.unit_amount.unwrap_or(0),
            currency: record.currency.unwrap_or_else(|| "usd".to_string()),
            current_period_start: record.current_period_start.and_then(format_timestamp),
            current_period_end: record.current_period_end.and_then(format_timestamp),
            cancel_at_period_end: record.cancel_at_period_end,
            created_at: format_timestamp(record.created_at),
        }
    }
}

impl From<SubscriptionWithUser> for AdminSubscription {
    fn from(row: SubscriptionWithUser) -> Self {
        Self::new(row.subscription, row.user_email)
    }
}

#[derive(Debug, Serialize)]
pub struct AdminInvoice {
    pub invoice_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    pub subscription_id: Option<String>,
    pub amount_due: i64,
    pub amount_paid: i64,
    pub currency: String,
    pub status: String,
    pub created_at: Option<String>,
    pub invoice_pdf: Option<String>,
    pub hosted_invoice_url: Option<String>,
}

impl AdminInvoice {
    pub fn new(invoice: InvoiceRecord, user_email: Option<String>) -> Self {
        Self {
            invoice_id: invoice.invoice_id,
            user_email,
            subscription_id: invoice.subscription_id,
            amount_due: invoice.amount_due,
            amount_paid: invoice.amount_paid,
            currency: invoice.currency,
            status: invoice.status,
            created_at: format_timestamp(invoice.created_at),
            invoice_pdf: invoice.invoice_pdf,
            hosted_invoice_url: invoice.hosted_invoice_url,
        }
    }
}

impl From<InvoiceWithUser> for AdminInvoice {
    fn from(row: InvoiceWithUser) -> Self {
        Self::new(row.invoice, row.user_email)
    }
}

#[derive(Debug, Serialize)]
pub struct BillingHistoryResponse {
    pub billing_history: Vec<AdminInvoice>,
}
