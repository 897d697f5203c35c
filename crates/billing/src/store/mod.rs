//! Persistence for webhook events and billing records
//!
//! [`BillingStore`] exposes domain-level operations rather than raw CRUD so
//! that every multi-row mutation a handler needs happens atomically inside
//! one implementation call.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    Invoice, NewInvoice, NewWebhookEvent, Payment, PaymentUpsert, Subscription,
    SubscriptionActivation, SubscriptionStub, User, WebhookEvent, WebhookStatus,
};

/// Listing filter for the webhook audit log
#[derive(Debug, Clone, Default)]
pub struct WebhookEventFilter {
    pub status: Option<WebhookStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl WebhookEventFilter {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 500;

    pub fn new(status: Option<WebhookStatus>, limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            status,
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // ---- webhook events ----

    async fn find_webhook_event(&self, provider_event_id: &str)
        -> BillingResult<Option<WebhookEvent>>;

    async fn get_webhook_event(&self, id: Uuid) -> BillingResult<Option<WebhookEvent>>;

    /// Insert a `received` event. A duplicate `provider_event_id` fails with
    /// `BillingError::AlreadyExists`.
    async fn create_webhook_event(&self, event: NewWebhookEvent) -> BillingResult<WebhookEvent>;

    /// Terminal success; clears any earlier error message
    async fn mark_webhook_completed(&self, id: Uuid) -> BillingResult<()>;

    async fn mark_webhook_failed(&self, id: Uuid, error_message: &str) -> BillingResult<()>;

    /// Put a failed or stuck event back to `received` for another run.
    /// Completed events are refused with `BillingError::InvalidState`.
    async fn reset_webhook_for_replay(&self, id: Uuid) -> BillingResult<WebhookEvent>;

    /// Newest first
    async fn list_webhook_events(&self, filter: WebhookEventFilter)
        -> BillingResult<Vec<WebhookEvent>>;

    /// `received` events created before `older_than`, oldest first
    async fn list_stale_received_events(
        &self,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEvent>>;

    // ---- users and customers ----

    async fn get_user(&self, id: Uuid) -> BillingResult<Option<User>>;

    async fn resolve_customer(&self, provider_customer_id: &str) -> BillingResult<Option<Uuid>>;

    /// Upsert the customer mapping; the latest owner wins
    async fn link_customer(&self, provider_customer_id: &str, user_id: Uuid) -> BillingResult<()>;

    // ---- payments and subscriptions ----

    /// Upsert a payment by `provider_payment_id`, first creating a `pending`
    /// subscription stub when one is given and none exists. Existing
    /// subscriptions keep their status. Atomic.
    async fn record_payment(
        &self,
        payment: PaymentUpsert,
        stub: Option<SubscriptionStub>,
    ) -> BillingResult<Payment>;

    async fn find_payment(&self, provider_payment_id: &str) -> BillingResult<Option<Payment>>;

    async fn find_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// Mark the subscription `active` and mirror its plan onto the owner's
    /// tier. Fails with `SubscriptionNotFound` when no row exists.
    ///
    /// A cancelled subscription is terminal: it is returned unchanged and the
    /// tier is left alone.
    async fn activate_subscription(
        &self,
        provider_subscription_id: &str,
        owner: Uuid,
        activation: SubscriptionActivation,
    ) -> BillingResult<Subscription>;

    /// Move `next_billing_date` and append a paid invoice
    async fn renew_subscription(
        &self,
        provider_subscription_id: &str,
        next_billing_date: OffsetDateTime,
        invoice: NewInvoice,
    ) -> BillingResult<Invoice>;

    async fn hold_subscription(&self, provider_subscription_id: &str)
        -> BillingResult<Subscription>;

    /// Mark `cancelled`, keep the first `cancelled_at` stamp, and put the
    /// owner back on the free tier
    async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
        owner: Uuid,
        cancelled_at: OffsetDateTime,
    ) -> BillingResult<Subscription>;

    async fn list_invoices(&self, subscription_id: Uuid) -> BillingResult<Vec<Invoice>>;
}
