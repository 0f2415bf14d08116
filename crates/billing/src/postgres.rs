//! Postgres implementation of the billing stores

use std::time::Duration;

use async_trait::async_trait;
use lexfam_shared::{BillingInterval, Page, Provider, Role, SubscriptionStatus, User};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{
    InvoiceRecord, InvoiceWithUser, NewSubscription, PriceRecord, SubscriptionRecord,
    SubscriptionStore, SubscriptionUpdate, SubscriptionWithUser, WriteOutcome,
};
use crate::usage::UsageStore;
use crate::users::{NewUser, UserStore, UserSummary};
use crate::webhooks::{ClaimResult, ProcessingResult, StoredEvent, WebhookEvent, WebhookEventStore};

const UNIQUE_VIOLATION: &str = "23505";

const USER_COLUMNS: &str = "identifier, email, display_name, password_hash, role, provider, \
                            message_count, created_at";

const SUBSCRIPTION_SELECT: &str = r#"
    SELECT
        s.stripe_subscription_id AS subscription_id,
        s.user_id,
        s.stripe_customer_id AS customer_id,
        s.stripe_price_id AS price_id,
        s.status,
        s.plan_name,
        s.billing_cycle,
        s.current_period_start,
        s.current_period_end,
        s.cancel_at_period_end,
        s.last_event_at,
        s.created_at,
        s.updated_at,
        p.unit_amount,
        p.currency,
        pr.name AS product_name,
        u.email AS user_email
    FROM stripe_subscriptions s
    LEFT JOIN stripe_prices p ON p.stripe_price_id = s.stripe_price_id
    LEFT JOIN stripe_products pr ON pr.stripe_product_id = p.stripe_product_id
    LEFT JOIN users u ON u.identifier = s.user_id
"#;

const INVOICE_COLUMNS: &str = "i.stripe_invoice_id AS invoice_id, i.stripe_customer_id AS customer_id, \
                               i.stripe_subscription_id AS subscription_id, i.amount_due, i.amount_paid, \
                               i.currency, i.status, i.invoice_pdf, i.hosted_invoice_url, i.created_at";

const EVENT_COLUMNS: &str = "stripe_event_id, event_type, payload, event_created_at, processing_result, \
                             error_message, attempts, processing_started_at, processed_at, created_at";

// Database row types
#[derive(sqlx::FromRow)]
struct UserRow {
    identifier: String,
    email: Option<String>,
    display_name: Option<String>,
    password_hash: Option<String>,
    role: String,
    provider: String,
    message_count: i64,
    created_at: OffsetDateTime,
}

impl TryFrom<UserRow> for User {
    type Error = BillingError;

    fn try_from(row: UserRow) -> BillingResult<Self> {
        Ok(User {
            identifier: row.identifier,
            email: row.email,
            display_name: row.display_name,
            password_hash: row.password_hash,
            role: parse_column::<Role>(&row.role)?,
            provider: parse_column::<Provider>(&row.provider)?,
            message_count: row.message_count,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UserSummaryRow {
    identifier: String,
    email: Option<String>,
    role: String,
    provider: String,
    created_at: OffsetDateTime,
    subscription_status: Option<String>,
}

#[derive(sqlx::FromRow)]
struct PriceRow {
    price_id: String,
    product_id: String,
    product_name: String,
    unit_amount: i64,
    currency: String,
    interval: String,
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    subscription_id: String,
    user_id: String,
    customer_id: String,
    price_id: String,
    status: String,
    plan_name: String,
    billing_cycle: Option<String>,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    last_event_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    unit_amount: Option<i64>,
    currency: Option<String>,
    product_name: Option<String>,
    user_email: Option<String>,
}

impl SubscriptionRow {
    fn into_record(self) -> BillingResult<(Option<String>, SubscriptionRecord)> {
        let record = SubscriptionRecord {
            subscription_id: self.subscription_id,
            user_id: self.user_id,
            customer_id: self.customer_id,
            price_id: self.price_id,
            status: parse_column::<SubscriptionStatus>(&self.status)?,
            plan_name: self.plan_name,
            billing_cycle: self
                .billing_cycle
                .as_deref()
                .map(parse_column::<BillingInterval>)
                .transpose()?,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            last_event_at: self.last_event_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            unit_amount: self.unit_amount,
            currency: self.currency,
            product_name: self.product_name,
        };
        Ok((self.user_email, record))
    }
}

#[derive(sqlx::FromRow)]
struct InvoiceRow {
    invoice_id: String,
    customer_id: String,
    subscription_id: Option<String>,
    amount_due: i64,
    amount_paid: i64,
    currency: String,
    status: String,
    invoice_pdf: Option<String>,
    hosted_invoice_url: Option<String>,
    created_at: OffsetDateTime,
}

impl From<InvoiceRow> for InvoiceRecord {
    fn from(row: InvoiceRow) -> Self {
        Self {
            invoice_id: row.invoice_id,
            customer_id: row.customer_id,
            subscription_id: row.subscription_id,
            amount_due: row.amount_due,
            amount_paid: row.amount_paid,
            currency: row.currency,
            status: row.status,
            invoice_pdf: row.invoice_pdf,
            hosted_invoice_url: row.hosted_invoice_url,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    stripe_event_id: String,
    event_type: String,
    payload: serde_json::Value,
    event_created_at: OffsetDateTime,
    processing_result: String,
    error_message: Option<String>,
    attempts: i32,
    processing_started_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<EventRow> for StoredEvent {
    type Error = BillingError;

    fn try_from(row: EventRow) -> BillingResult<Self> {
        Ok(StoredEvent {
            event_id: row.stripe_event_id,
            event_type: row.event_type,
            payload: row.payload,
            event_created_at: row.event_created_at,
            result: ProcessingResult::parse(&row.processing_result)?,
            error_message: row.error_message,
            attempts: row.attempts,
            processing_started_at: row.processing_started_at,
            processed_at: row.processed_at,
            created_at: row.created_at,
        })
    }
}

/// Enum columns are stored as text; a value we cannot parse is a data error
fn parse_column<T>(value: &str) -> BillingResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| BillingError::Database(format!("invalid column value {value:?}: {e}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

/// Billing stores backed by Postgres
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl UserStore for PgBillingStore {
    async fn create_user(&self, user: &NewUser) -> BillingResult<User> {
        let sql = format!(
            r#"
            INSERT INTO users (identifier, email, display_name, password_hash, role, provider)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {USER_COLUMNS}
            "#
        );

        let row: UserRow = sqlx::query_as(&sql)
            .bind(&user.identifier)
            .bind(&user.email)
            .bind(&user.display_name)
            .bind(&user.password_hash)
            .bind(user.role.as_str())
            .bind(user.provider.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    BillingError::AlreadyExists(format!("user {}", user.identifier))
                } else {
                    BillingError::from(e)
                }
            })?;

        row.try_into()
    }

    async fn get_user(&self, identifier: &str) -> BillingResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE identifier = $1");
        let row: Option<UserRow> = sqlx::query_as(&sql)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;

        row.map(User::try_from).transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> BillingResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let row: Option<UserRow> = sqlx::query_as(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        row.map(User::try_from).transpose()
    }

    async fn set_role(&self, identifier: &str, role: Role) -> BillingResult<bool> {
        let result = sqlx::query("UPDATE users SET role = $2 WHERE identifier = $1")
            .bind(identifier)
            .bind(role.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_users(&self, page: Page) -> BillingResult<Vec<UserSummary>> {
        let sql = format!(
            r#"
            SELECT
                u.identifier,
                u.email,
                u.role,
                u.provider,
                u.created_at,
                (
                    SELECT s.status
                    FROM stripe_subscriptions s
                    WHERE s.user_id = u.identifier
                      AND s.status IN {current}
                    ORDER BY s.created_at DESC, s.id DESC
                    LIMIT 1
                ) AS subscription_status
            FROM users u
            ORDER BY u.created_at DESC, u.identifier
            LIMIT $1 OFFSET $2
            "#,
            current = SubscriptionStatus::CURRENT_SQL
        );

        let rows: Vec<UserSummaryRow> = sqlx::query_as(&sql)
            .bind(i64::from(page.limit))
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(UserSummary {
                    identifier: row.identifier,
                    email: row.email,
                    role: parse_column::<Role>(&row.role)?,
                    provider: parse_column::<Provider>(&row.provider)?,
                    created_at: row.created_at,
                    subscription_status: row
                        .subscription_status
                        .as_deref()
                        .map(parse_column::<SubscriptionStatus>)
                        .transpose()?,
                })
            })
            .collect()
    }

    async fn count_users(&self) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn ping(&self) -> BillingResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for PgBillingStore {
    async fn get_count(&self, user_id: &str) -> BillingResult<i64> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT message_count FROM users WHERE identifier = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count.unwrap_or(0))
    }

    async fn increment(&self, user_id: &str) -> BillingResult<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE users
            SET message_count = COALESCE(message_count, 0) + 1
            WHERE identifier = $1
            RETURNING message_count
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.unwrap_or(0))
    }

    async fn reset(&self, user_id: &str) -> BillingResult<bool> {
        let result = sqlx::query("UPDATE users SET message_count = 0 WHERE identifier = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn get_customer_id(&self, user_id: &str) -> BillingResult<Option<String>> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT stripe_customer_id FROM stripe_customers WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id)
    }

    async fn upsert_customer(
        &self,
        user_id: &str,
        customer_id: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stripe_customers (user_id, stripe_customer_id, email, name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE SET
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                email = COALESCE(EXCLUDED.email, stripe_customers.email),
                name = COALESCE(EXCLUDED.name, stripe_customers.name),
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .bind(email)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BillingError::AlreadyExists(format!("customer {customer_id}"))
            } else {
                BillingError::from(e)
            }
        })?;

        Ok(())
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<String>> {
        let user_id: Option<String> =
            sqlx::query_scalar("SELECT user_id FROM stripe_customers WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(user_id)
    }

    async fn get_price(&self, price_id: &str) -> BillingResult<Option<PriceRecord>> {
        let row: Option<PriceRow> = sqlx::query_as(
            r#"
            SELECT
                p.stripe_price_id AS price_id,
                p.stripe_product_id AS product_id,
                pr.name AS product_name,
                p.unit_amount,
                p.currency,
                p.interval
            FROM stripe_prices p
            JOIN stripe_products pr ON pr.stripe_product_id = p.stripe_product_id
            WHERE p.stripe_price_id = $1
            "#,
        )
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(PriceRecord {
                price_id: row.price_id,
                product_id: row.product_id,
                product_name: row.product_name,
                unit_amount: row.unit_amount,
                currency: row.currency,
                interval: parse_column::<BillingInterval>(&row.interval)?,
            })
        })
        .transpose()
    }

    async fn insert_price(&self, price: &PriceRecord) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO stripe_products (stripe_product_id, name)
            VALUES ($1, $2)
            ON CONFLICT (stripe_product_id) DO NOTHING
            "#,
        )
        .bind(&price.product_id)
        .bind(&price.product_name)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO stripe_prices (stripe_price_id, stripe_product_id, unit_amount, currency, interval)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stripe_price_id) DO NOTHING
            "#,
        )
        .bind(&price.price_id)
        .bind(&price.product_id)
        .bind(price.unit_amount)
        .bind(&price.currency)
        .bind(price.interval.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_current_subscription(
        &self,
        user_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            "{SUBSCRIPTION_SELECT} WHERE s.user_id = $1 AND s.status IN {} \
             ORDER BY s.created_at DESC, s.id DESC LIMIT 1",
            SubscriptionStatus::CURRENT_SQL
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(SubscriptionRow::into_record).transpose()?.map(|(_, r)| r))
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!("{SUBSCRIPTION_SELECT} WHERE s.stripe_subscription_id = $1");
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(SubscriptionRow::into_record).transpose()?.map(|(_, r)| r))
    }

    async fn upsert_subscription(&self, sub: &NewSubscription) -> BillingResult<WriteOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO stripe_subscriptions (
                user_id, stripe_subscription_id, stripe_customer_id, stripe_price_id,
                status, plan_name, billing_cycle, current_period_start, current_period_end,
                cancel_at_period_end, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                status = EXCLUDED.status,
                plan_name = EXCLUDED.plan_name,
                billing_cycle = EXCLUDED.billing_cycle,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            WHERE stripe_subscriptions.last_event_at IS NULL
               OR stripe_subscriptions.last_event_at <= EXCLUDED.last_event_at
            "#,
        )
        .bind(&sub.user_id)
        .bind(&sub.subscription_id)
        .bind(&sub.customer_id)
        .bind(&sub.price_id)
        .bind(sub.status.as_str())
        .bind(&sub.plan_name)
        .bind(sub.billing_cycle.map(|c| c.as_str()))
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.cancel_at_period_end)
        .bind(sub.observed_at)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            WriteOutcome::Applied
        } else {
            WriteOutcome::Stale
        })
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> BillingResult<WriteOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE stripe_subscriptions SET
                status = COALESCE($2, status),
                current_period_start = COALESCE($3, current_period_start),
                current_period_end = COALESCE($4, current_period_end),
                cancel_at_period_end = COALESCE($5, cancel_at_period_end),
                stripe_price_id = COALESCE($6, stripe_price_id),
                billing_cycle = COALESCE($7, billing_cycle),
                last_event_at = $8,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
              AND (last_event_at IS NULL OR last_event_at <= $8)
            "#,
        )
        .bind(subscription_id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.current_period_start)
        .bind(update.current_period_end)
        .bind(update.cancel_at_period_end)
        .bind(update.price_id.as_deref())
        .bind(update.billing_cycle.map(|c| c.as_str()))
        .bind(update.observed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(WriteOutcome::Applied);
        }

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT id FROM stripe_subscriptions WHERE stripe_subscription_id = $1")
                .bind(subscription_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(if exists.is_some() {
            WriteOutcome::Stale
        } else {
            WriteOutcome::Missing
        })
    }

    async fn mark_cancel_at_period_end(&self, user_id: &str, cancel: bool) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stripe_subscriptions SET
                cancel_at_period_end = $2,
                -- held back by LOCAL_CLOCK_SKEW
                last_event_at = GREATEST(COALESCE(last_event_at, NOW() - INTERVAL '60 seconds'), NOW() - INTERVAL '60 seconds'),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM stripe_subscriptions
                WHERE user_id = $1 AND status IN ('active', 'trialing')
                ORDER BY created_at DESC, id DESC
                LIMIT 1
            )
            "#,
        )
        .bind(user_id)
        .bind(cancel)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_current_subscription_users(&self) -> BillingResult<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT user_id FROM stripe_subscriptions WHERE status IN {} ORDER BY user_id",
            SubscriptionStatus::CURRENT_SQL
        );
        let users: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(users)
    }

    async fn list_subscriptions(&self, page: Page) -> BillingResult<Vec<SubscriptionWithUser>> {
        let sql = format!("{SUBSCRIPTION_SELECT} ORDER BY s.created_at DESC, s.id DESC LIMIT $1 OFFSET $2");
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(i64::from(page.limit))
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let (user_email, subscription) = row.into_record()?;
                Ok(SubscriptionWithUser {
                    user_email,
                    subscription,
                })
            })
            .collect()
    }

    async fn upsert_invoice(&self, invoice: &InvoiceRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stripe_invoices (
                stripe_invoice_id, stripe_customer_id, stripe_subscription_id, amount_due,
                amount_paid, currency, status, invoice_pdf, hosted_invoice_url, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (stripe_invoice_id) DO UPDATE SET
                stripe_subscription_id = COALESCE(EXCLUDED.stripe_subscription_id, stripe_invoices.stripe_subscription_id),
                amount_due = EXCLUDED.amount_due,
                amount_paid = EXCLUDED.amount_paid,
                status = EXCLUDED.status,
                invoice_pdf = COALESCE(EXCLUDED.invoice_pdf, stripe_invoices.invoice_pdf),
                hosted_invoice_url = COALESCE(EXCLUDED.hosted_invoice_url, stripe_invoices.hosted_invoice_url)
            "#,
        )
        .bind(&invoice.invoice_id)
        .bind(&invoice.customer_id)
        .bind(&invoice.subscription_id)
        .bind(invoice.amount_due)
        .bind(invoice.amount_paid)
        .bind(&invoice.currency)
        .bind(&invoice.status)
        .bind(&invoice.invoice_pdf)
        .bind(&invoice.hosted_invoice_url)
        .bind(invoice.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_invoices_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<InvoiceRecord>> {
        let sql = format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM stripe_invoices i
            JOIN stripe_customers c ON c.stripe_customer_id = i.stripe_customer_id
            WHERE c.user_id = $1
            ORDER BY i.created_at DESC
            LIMIT $2
            "#
        );
        let rows: Vec<InvoiceRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(InvoiceRecord::from).collect())
    }

    async fn list_invoices(&self, page: Page) -> BillingResult<Vec<InvoiceWithUser>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            #[sqlx(flatten)]
            invoice: InvoiceRow,
            user_email: Option<String>,
        }

        let sql = format!(
            r#"
            SELECT {INVOICE_COLUMNS}, u.email AS user_email
            FROM stripe_invoices i
            LEFT JOIN stripe_customers c ON c.stripe_customer_id = i.stripe_customer_id
            LEFT JOIN users u ON u.identifier = c.user_id
            ORDER BY i.created_at DESC
            LIMIT $1 OFFSET $2
            "#
        );
        let rows: Vec<Row> = sqlx::query_as(&sql)
            .bind(i64::from(page.limit))
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvoiceWithUser {
                user_email: row.user_email,
                invoice: row.invoice.into(),
            })
            .collect())
    }
}

#[async_trait]
impl WebhookEventStore for PgBillingStore {
    async fn claim_event(
        &self,
        event: &WebhookEvent,
        stale_after: Duration,
    ) -> BillingResult<ClaimResult> {
        let claimed: Option<i32> = sqlx::query_scalar(
            r#"
            INSERT INTO stripe_events (id, stripe_event_id, event_type, payload, event_created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                attempts = stripe_events.attempts + 1,
                processing_started_at = NOW(),
                error_message = NULL,
                processed_at = NULL
            WHERE stripe_events.processing_result IN ('error', 'unprocessable')
               OR (stripe_events.processing_result = 'processing'
                   AND stripe_events.processing_started_at < NOW() - make_interval(secs => $6))
            RETURNING attempts
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.created_at())
        .bind(stale_after.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(attempts) = claimed {
            if attempts > 1 {
                tracing::info!(event_id = %event.id, attempts, "Re-claimed webhook event");
            }
            return Ok(ClaimResult::Claimed);
        }

        let result: String = sqlx::query_scalar(
            "SELECT processing_result FROM stripe_events WHERE stripe_event_id = $1",
        )
        .bind(&event.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(match ProcessingResult::parse(&result)? {
            ProcessingResult::Processing => ClaimResult::InFlight,
            other => ClaimResult::AlreadyProcessed(other),
        })
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_events
            SET processing_result = $2, error_message = $3, processed_at = NOW()
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(result.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<StoredEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM stripe_events WHERE stripe_event_id = $1");
        let row: Option<EventRow> = sqlx::query_as(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(StoredEvent::try_from).transpose()
    }

    async fn list_events(
        &self,
        results: &[ProcessingResult],
        started_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<StoredEvent>> {
        let results: Vec<String> = results.iter().map(|r| r.as_str().to_string()).collect();
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM stripe_events
            WHERE processing_result = ANY($1)
              AND processing_started_at <= $2
            ORDER BY processing_started_at ASC
            LIMIT $3
            "#
        );
        let rows: Vec<EventRow> = sqlx::query_as(&sql)
            .bind(&results)
            .bind(started_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(StoredEvent::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_column_reports_database_error() {
        assert_eq!(parse_column::<Role>("ADMIN").unwrap(), Role::Admin);
        assert!(matches!(
            parse_column::<SubscriptionStatus>("bogus"),
            Err(BillingError::Database(_))
        ));
    }
}
