//! Stripe webhook ingestion
//!
//! Events are verified, claimed in the event log, dispatched, and their result
//! recorded. The claim is atomic, so a redelivered or concurrently delivered
//! event is applied at most once; failed events stay claimable for a later
//! delivery or replay.
//!
//! Subscription writes carry the event's creation time and the store skips
//! writes older than the newest observation already applied to the row, so
//! out-of-order deliveries cannot roll state back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use lexfam_shared::SubscriptionStatus;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{unix_to_datetime, InvoiceSnapshot, SubscriptionSnapshot};
use crate::subscriptions::{
    InvoiceRecord, NewSubscription, PriceCatalog, SubscriptionStore, SubscriptionUpdate,
    WriteOutcome, DEFAULT_PLAN_NAME,
};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A claim older than this is considered abandoned and may be taken over
pub const STALE_PROCESSING_AFTER: Duration = Duration::from_secs(30 * 60);

/// Events are not replayed automatically after this many attempts
pub const MAX_REPLAY_ATTEMPTS: i32 = 10;

// =============================================================================
// Event envelope
// =============================================================================

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: Option<i64>,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: Value,
}

/// A parsed webhook event with its raw payload
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: Option<i64>,
    /// The `data.object` of the event
    pub object: Value,
    /// Full payload as received, kept for the event log
    pub payload: Value,
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(payload: Value) -> BillingResult<Self> {
        let envelope: Envelope = serde_json::from_value(payload.clone())
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

        Ok(Self {
            id: envelope.id,
            event_type: envelope.event_type,
            created: envelope.created,
            object: envelope.data.object,
            payload,
        })
    }

    /// When Stripe created the event; used to order subscription writes
    pub fn created_at(&self) -> OffsetDateTime {
        self.created
            .and_then(unix_to_datetime)
            .unwrap_or_else(OffsetDateTime::now_utc)
    }
}

// =============================================================================
// Event log port
// =============================================================================

/// Recorded outcome of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingResult {
    Processing,
    Success,
    Error,
    /// Well-formed but not applicable, e.g. an unknown customer
    Unprocessable,
    /// Event type this service does not handle
    Ignored,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingResult::Processing => "processing",
            ProcessingResult::Success => "success",
            ProcessingResult::Error => "error",
            ProcessingResult::Unprocessable => "unprocessable",
            ProcessingResult::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "processing" => Ok(ProcessingResult::Processing),
            "success" => Ok(ProcessingResult::Success),
            "error" => Ok(ProcessingResult::Error),
            "unprocessable" => Ok(ProcessingResult::Unprocessable),
            "ignored" => Ok(ProcessingResult::Ignored),
            other => Err(BillingError::Database(format!("unknown processing result: {other}"))),
        }
    }

    /// Results that a new claim may take over
    pub fn is_reclaimable(&self) -> bool {
        matches!(self, ProcessingResult::Error | ProcessingResult::Unprocessable)
    }
}

/// A logged event
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
    pub event_created_at: OffsetDateTime,
    pub result: ProcessingResult,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub processing_started_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Result of trying to claim an event for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    Claimed,
    /// Finished earlier with this result
    AlreadyProcessed(ProcessingResult),
    /// Another worker holds a fresh claim
    InFlight,
}

/// Append-only webhook event log
#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Insert the event as `processing`, or take over an errored or abandoned claim
    async fn claim_event(&self, event: &WebhookEvent, stale_after: Duration)
        -> BillingResult<ClaimResult>;

    async fn finish_event(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<StoredEvent>>;

    /// Events with one of `results` whose last attempt started before `started_before`
    async fn list_events(
        &self,
        results: &[ProcessingResult],
        started_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<StoredEvent>>;
}

// =============================================================================
// Signatures
// =============================================================================

/// Verify a `stripe-signature` header (`t=<unix>,v1=<hex>[,v1=...]`)
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());

    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        tracing::warn!(candidates = signatures.len(), "Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// Build a valid signature header, for local tooling and tests
pub fn signature_header(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes())))
}

// =============================================================================
// Handler
// =============================================================================

/// What happened to a delivered event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Already handled or being handled elsewhere
    Duplicate,
    Ignored,
    /// Recorded but not applicable
    Unprocessable(String),
}

/// Counts from a replay sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    events: Arc<dyn WebhookEventStore>,
    store: Arc<dyn SubscriptionStore>,
    prices: PriceCatalog,
    webhook_secret: Option<String>,
}

impl WebhookHandler {
    pub fn new(
        events: Arc<dyn WebhookEventStore>,
        store: Arc<dyn SubscriptionStore>,
        prices: PriceCatalog,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            events,
            store,
            prices,
            webhook_secret,
        }
    }

    /// Verify the signature (when a secret is configured) and parse the event
    pub fn verify_event(&self, payload: &str, signature: Option<&str>) -> BillingResult<WebhookEvent> {
        match &self.webhook_secret {
            Some(secret) => {
                let header = signature.ok_or(BillingError::WebhookSignatureInvalid)?;
                verify_signature(payload, header, secret, OffsetDateTime::now_utc().unix_timestamp())?;
            }
            None => {
                tracing::warn!("STRIPE_WEBHOOK_SECRET not set, accepting unverified webhook");
            }
        }

        WebhookEvent::parse(payload)
    }

    /// Log, claim, apply and record one event
    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        match self.events.claim_event(event, STALE_PROCESSING_AFTER).await? {
            ClaimResult::Claimed => {}
            ClaimResult::AlreadyProcessed(result) => {
                tracing::info!(
                    event_id = %event.id,
                    result = result.as_str(),
                    "Webhook event already processed, skipping"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            ClaimResult::InFlight => {
                tracing::info!(event_id = %event.id, "Webhook event in flight elsewhere, skipping");
                return Ok(WebhookOutcome::Duplicate);
            }
        }

        tracing::info!(
            event_type = %event.event_type,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let outcome = self.dispatch(event).await;

        let (result, message) = match &outcome {
            Ok(WebhookOutcome::Ignored) => (ProcessingResult::Ignored, None),
            Ok(WebhookOutcome::Unprocessable(reason)) => {
                (ProcessingResult::Unprocessable, Some(reason.clone()))
            }
            Ok(_) => (ProcessingResult::Success, None),
            Err(e) => (ProcessingResult::Error, Some(e.to_string())),
        };
        self.record_result(&event.id, result, message.as_deref()).await;

        if let Err(e) = &outcome {
            tracing::error!(
                event_type = %event.event_type,
                event_id = %event.id,
                error = %e,
                "Webhook event processing failed"
            );
        }
        outcome
    }

    async fn record_result(&self, event_id: &str, result: ProcessingResult, message: Option<&str>) {
        for attempt in 1..=2 {
            match self.events.finish_event(event_id, result, message).await {
                Ok(()) => return,
                Err(e) => tracing::warn!(
                    event_id = %event_id,
                    attempt,
                    error = %e,
                    "Failed to record webhook result"
                ),
            }
        }
        tracing::error!(
            event_id = %event_id,
            "Giving up recording webhook result; claim will expire"
        );
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        match event.event_type.as_str() {
            "customer.subscription.created" => self.on_subscription_created(event).await,
            "customer.subscription.updated" => self.on_subscription_updated(event).await,
            "customer.subscription.deleted" => self.on_subscription_deleted(event).await,
            "invoice.payment_succeeded" | "invoice.paid" => self.on_invoice(event, true).await,
            "invoice.payment_failed" => self.on_invoice(event, false).await,
            other => {
                tracing::info!(event_type = %other, "Unhandled webhook event type");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn on_subscription_created(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let snapshot = SubscriptionSnapshot::from_value(&event.object)?;
        self.upsert_from_snapshot(&snapshot, None, event.created_at()).await
    }

    async fn on_subscription_updated(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let snapshot = SubscriptionSnapshot::from_value(&event.object)?;
        let observed_at = event.created_at();

        if self.store.get_subscription(&snapshot.id).await?.is_none() {
            return self.upsert_from_snapshot(&snapshot, None, observed_at).await;
        }

        let mut update = SubscriptionUpdate::from_snapshot(&snapshot, observed_at);
        if let Some(price_id) = snapshot.price_id() {
            let price = self.prices.get_or_create_price(price_id).await?;
            update.billing_cycle = Some(price.interval);
            update.price_id = Some(price.price_id);
        }

        let outcome = self.store.update_subscription(&snapshot.id, &update).await?;
        log_write(&snapshot.id, &event.id, outcome);
        Ok(WebhookOutcome::Processed)
    }

    async fn on_subscription_deleted(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let snapshot = SubscriptionSnapshot::from_value(&event.object)?;
        // Deletion is terminal, so it applies whatever the row has seen since
        let observed_at = OffsetDateTime::now_utc().max(event.created_at());

        let update = SubscriptionUpdate::observed_at(observed_at).status(SubscriptionStatus::Canceled);
        match self.store.update_subscription(&snapshot.id, &update).await? {
            WriteOutcome::Missing => {
                self.upsert_from_snapshot(&snapshot, Some(SubscriptionStatus::Canceled), observed_at)
                    .await
            }
            outcome => {
                log_write(&snapshot.id, &event.id, outcome);
                Ok(WebhookOutcome::Processed)
            }
        }
    }

    async fn upsert_from_snapshot(
        &self,
        snapshot: &SubscriptionSnapshot,
        status: Option<SubscriptionStatus>,
        observed_at: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let Some(customer_id) = snapshot.customer_id.as_deref() else {
            return Ok(unprocessable(format!("subscription {} has no customer", snapshot.id)));
        };
        let Some(user_id) = self.store.find_user_by_customer(customer_id).await? else {
            tracing::warn!(
                customer_id = %customer_id,
                subscription_id = %snapshot.id,
                "No user mapped to Stripe customer"
            );
            return Ok(unprocessable(format!("no user for customer {customer_id}")));
        };
        let Some(price_id) = snapshot.price_id() else {
            return Ok(unprocessable(format!("subscription {} has no price", snapshot.id)));
        };

        let price = self.prices.get_or_create_price(price_id).await?;

        let outcome = self
            .store
            .upsert_subscription(&NewSubscription {
                subscription_id: snapshot.id.clone(),
                user_id: user_id.clone(),
                customer_id: customer_id.to_string(),
                price_id: price.price_id.clone(),
                status: status.unwrap_or(snapshot.status),
                plan_name: DEFAULT_PLAN_NAME.to_string(),
                billing_cycle: Some(price.interval),
                current_period_start: snapshot.period_start(),
                current_period_end: snapshot.period_end(),
                cancel_at_period_end: snapshot.effective_cancel_at_period_end(),
                observed_at,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %snapshot.id,
            outcome = ?outcome,
            "Upserted subscription from webhook"
        );
        Ok(WebhookOutcome::Processed)
    }

    async fn on_invoice(&self, event: &WebhookEvent, paid: bool) -> BillingResult<WebhookOutcome> {
        let invoice = InvoiceSnapshot::from_value(&event.object)?;

        if self.store.find_user_by_customer(&invoice.customer_id).await?.is_none() {
            return Ok(unprocessable(format!(
                "no user for customer {}",
                invoice.customer_id
            )));
        }

        // Invoices may precede their subscription; the link is optional
        let subscription_id = match invoice.subscription_id.as_deref() {
            Some(id) if self.store.get_subscription(id).await?.is_some() => Some(id.to_string()),
            _ => None,
        };

        let amount_paid = if paid {
            invoice.amount_paid.unwrap_or(invoice.amount_due)
        } else {
            invoice.amount_paid.unwrap_or(0)
        };
        let status = invoice
            .status
            .clone()
            .unwrap_or_else(|| if paid { "paid" } else { "open" }.to_string());

        self.store
            .upsert_invoice(&InvoiceRecord {
                invoice_id: invoice.id.clone(),
                customer_id: invoice.customer_id.clone(),
                subscription_id,
                amount_due: invoice.amount_due,
                amount_paid,
                currency: invoice.currency.clone(),
                status,
                invoice_pdf: invoice.invoice_pdf.clone(),
                hosted_invoice_url: invoice.hosted_invoice_url.clone(),
                created_at: invoice
                    .created
                    .and_then(unix_to_datetime)
                    .unwrap_or_else(|| event.created_at()),
            })
            .await?;

        tracing::info!(
            invoice_id = %invoice.id,
            customer_id = %invoice.customer_id,
            paid,
            "Recorded invoice from webhook"
        );
        Ok(WebhookOutcome::Processed)
    }

    // -------------------------------------------------------------------------
    // Operator support
    // -------------------------------------------------------------------------

    /// Errored and unprocessable events, newest attempts last
    pub async fn list_failed(&self, limit: i64) -> BillingResult<Vec<StoredEvent>> {
        self.events
            .list_events(
                &[ProcessingResult::Error, ProcessingResult::Unprocessable],
                OffsetDateTime::now_utc(),
                limit.clamp(1, 500),
            )
            .await
    }

    /// Re-run a logged event from its stored payload
    pub async fn replay(&self, event_id: &str) -> BillingResult<WebhookOutcome> {
        let stored = self
            .events
            .get_event(event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {event_id}")))?;

        let event = WebhookEvent::from_value(stored.payload)?;
        tracing::info!(event_id = %event_id, attempts = stored.attempts, "Replaying webhook event");
        self.handle_event(&event).await
    }

    /// Replay errored events whose last attempt is older than `min_age`
    pub async fn replay_failed(&self, min_age: Duration, limit: i64) -> BillingResult<ReplayReport> {
        let cutoff = OffsetDateTime::now_utc() - min_age;
        let events = self
            .events
            .list_events(&[ProcessingResult::Error], cutoff, limit)
            .await?;

        let mut report = ReplayReport::default();
        for stored in events {
            if stored.attempts >= MAX_REPLAY_ATTEMPTS {
                report.skipped += 1;
                continue;
            }

            let outcome = match WebhookEvent::from_value(stored.payload) {
                Ok(event) => self.handle_event(&event).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(_) => report.replayed += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(event_id = %stored.event_id, error = %e, "Replay failed");
                }
            }
        }

        Ok(report)
    }
}

fn unprocessable(reason: String) -> WebhookOutcome {
    WebhookOutcome::Unprocessable(reason)
}

fn log_write(subscription_id: &str, event_id: &str, outcome: WriteOutcome) {
    match outcome {
        WriteOutcome::Applied => {
            tracing::info!(subscription_id = %subscription_id, event_id = %event_id, "Applied subscription update");
        }
        WriteOutcome::Stale => {
            tracing::info!(
                subscription_id = %subscription_id,
                event_id = %event_id,
                "Skipped out-of-order subscription update"
            );
        }
        WriteOutcome::Missing => {
            tracing::warn!(subscription_id = %subscription_id, event_id = %event_id, "Subscription row missing");
        }
    }
}
