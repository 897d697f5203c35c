//! In-memory billing store
//!
//! Mirrors the Postgres semantics (unique keys, atomic multi-row updates)
//! under a single lock. Used by tests and local runs without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BillingStore, WebhookEventFilter};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    Invoice, NewInvoice, NewWebhookEvent, Payment, PaymentUpsert, Subscription,
    SubscriptionActivation, SubscriptionStatus, SubscriptionStub, User, WebhookEvent,
    WebhookStatus, INVOICE_STATUS_PAID, PAYMENT_STATUS_SUCCEEDED,
};
use recap_shared::FREE_TIER;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    customers: HashMap<String, Uuid>,
    /// Keyed by `provider_event_id`
    events: HashMap<String, WebhookEvent>,
    /// Keyed by `provider_subscription_id`
    subscriptions: HashMap<String, Subscription>,
    /// Keyed by `provider_payment_id`
    payments: HashMap<String, Payment>,
    invoices: Vec<Invoice>,
}

impl State {
    fn event_mut(&mut self, id: Uuid) -> BillingResult<&mut WebhookEvent> {
        self.events
            .values_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| BillingError::WebhookEventNotFound(id.to_string()))
    }

    fn subscription_mut(&mut self, provider_subscription_id: &str) -> BillingResult<&mut Subscription> {
        self.subscriptions
            .get_mut(provider_subscription_id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(provider_subscription_id.to_string()))
    }

    fn set_tier(&mut self, user_id: Uuid, tier: &str) {
        if let Some(user) = self.users.get_mut(&user_id) {
            user.subscription_tier = tier.to_string();
        }
    }
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user on the free tier
    pub async fn insert_user(&self, email: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            subscription_tier: FREE_TIER.to_string(),
        };
        self.state.lock().await.users.insert(user.id, user.clone());
        user
    }

    pub async fn webhook_event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }

    pub async fn payment_count(&self) -> usize {
        self.state.lock().await.payments.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn find_webhook_event(
        &self,
        provider_event_id: &str,
    ) -> BillingResult<Option<WebhookEvent>> {
        Ok(self.state.lock().await.events.get(provider_event_id).cloned())
    }

    async fn get_webhook_event(&self, id: Uuid) -> BillingResult<Option<WebhookEvent>> {
        Ok(self
            .state
            .lock()
            .await
            .events
            .values()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn create_webhook_event(&self, event: NewWebhookEvent) -> BillingResult<WebhookEvent> {
        let mut state = self.state.lock().await;
        if state.events.contains_key(&event.provider_event_id) {
            return Err(BillingError::AlreadyExists(event.provider_event_id));
        }

        let now = OffsetDateTime::now_utc();
        let record = WebhookEvent {
            id: Uuid::new_v4(),
            provider_event_id: event.provider_event_id.clone(),
            event_type: event.event_type,
            status: WebhookStatus::Received,
            payload: event.payload,
            processed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        state
            .events
            .insert(event.provider_event_id, record.clone());
        Ok(record)
    }

    async fn mark_webhook_completed(&self, id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let event = state.event_mut(id)?;
        let now = OffsetDateTime::now_utc();
        event.status = WebhookStatus::Completed;
        event.processed_at = Some(now);
        event.error_message = None;
        event.updated_at = now;
        Ok(())
    }

    async fn mark_webhook_failed(&self, id: Uuid, error_message: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let event = state.event_mut(id)?;
        event.status = WebhookStatus::Failed;
        event.error_message = Some(error_message.to_string());
        event.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn reset_webhook_for_replay(&self, id: Uuid) -> BillingResult<WebhookEvent> {
        let mut state = self.state.lock().await;
        let event = state.event_mut(id)?;
        if event.status == WebhookStatus::Completed {
            return Err(BillingError::InvalidState(format!(
                "webhook event {id} already completed"
            )));
        }
        event.status = WebhookStatus::Received;
        event.error_message = None;
        event.processed_at = None;
        event.updated_at = OffsetDateTime::now_utc();
        Ok(event.clone())
    }

    async fn list_webhook_events(
        &self,
        filter: WebhookEventFilter,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<WebhookEvent> = state
            .events
            .values()
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(events
            .into_iter()
            .skip(usize::try_from(filter.offset).unwrap_or(0))
            .take(usize::try_from(filter.limit).unwrap_or(0))
            .collect())
    }

    async fn list_stale_received_events(
        &self,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<WebhookEvent> = state
            .events
            .values()
            .filter(|e| e.status == WebhookStatus::Received && e.created_at < older_than)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        events.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(events)
    }

    async fn get_user(&self, id: Uuid) -> BillingResult<Option<User>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn resolve_customer(&self, provider_customer_id: &str) -> BillingResult<Option<Uuid>> {
        Ok(self
            .state
            .lock()
            .await
            .customers
            .get(provider_customer_id)
            .copied())
    }

    async fn link_customer(&self, provider_customer_id: &str, user_id: Uuid) -> BillingResult<()> {
        self.state
            .lock()
            .await
            .customers
            .insert(provider_customer_id.to_string(), user_id);
        Ok(())
    }

    async fn record_payment(
        &self,
        payment: PaymentUpsert,
        stub: Option<SubscriptionStub>,
    ) -> BillingResult<Payment> {
        let mut state = self.state.lock().await;

        let subscription_id = match stub {
            Some(stub) => {
                let sub = state
                    .subscriptions
                    .entry(stub.provider_subscription_id.clone())
                    .or_insert_with(|| Subscription {
                        id: Uuid::new_v4(),
                        user_id: payment.user_id,
                        provider_subscription_id: stub.provider_subscription_id.clone(),
                        plan_slug: None,
                        product_id: None,
                        amount_cents: None,
                        status: SubscriptionStatus::Pending,
                        started_at: None,
                        next_billing_date: None,
                        cancelled_at: None,
                    });
                sub.plan_slug = sub.plan_slug.take().or(stub.plan_slug);
                sub.product_id = sub.product_id.take().or(stub.product_id);
                sub.amount_cents = sub.amount_cents.or(stub.amount_cents);
                Some(sub.id)
            }
            None => None,
        };

        let record = state
            .payments
            .entry(payment.provider_payment_id.clone())
            .and_modify(|existing| {
                existing.amount_cents = payment.amount_cents;
                if payment.currency.is_some() {
                    existing.currency = payment.currency.clone();
                }
                if subscription_id.is_some() {
                    existing.subscription_id = subscription_id;
                }
            })
            .or_insert_with(|| Payment {
                id: Uuid::new_v4(),
                user_id: payment.user_id,
                provider_payment_id: payment.provider_payment_id.clone(),
                amount_cents: payment.amount_cents,
                currency: payment.currency.clone(),
                status: PAYMENT_STATUS_SUCCEEDED.to_string(),
                subscription_id,
                processed_at: OffsetDateTime::now_utc(),
            });

        Ok(record.clone())
    }

    async fn find_payment(&self, provider_payment_id: &str) -> BillingResult<Option<Payment>> {
        Ok(self
            .state
            .lock()
            .await
            .payments
            .get(provider_payment_id)
            .cloned())
    }

    async fn find_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .get(provider_subscription_id)
            .cloned())
    }

    async fn activate_subscription(
        &self,
        provider_subscription_id: &str,
        owner: Uuid,
        activation: SubscriptionActivation,
    ) -> BillingResult<Subscription> {
        let mut state = self.state.lock().await;
        let sub = state.subscription_mut(provider_subscription_id)?;
        if sub.status == SubscriptionStatus::Cancelled {
            return Ok(sub.clone());
        }

        sub.status = SubscriptionStatus::Active;
        sub.started_at = sub.started_at.or(Some(activation.started_at));
        if activation.next_billing_date.is_some() {
            sub.next_billing_date = activation.next_billing_date;
        }
        if activation.plan_slug.is_some() {
            sub.plan_slug = activation.plan_slug;
        }
        if activation.product_id.is_some() {
            sub.product_id = activation.product_id;
        }
        if activation.amount_cents.is_some() {
            sub.amount_cents = activation.amount_cents;
        }

        let updated = sub.clone();
        if let Some(plan) = &updated.plan_slug {
            state.set_tier(owner, plan);
        }
        Ok(updated)
    }

    async fn renew_subscription(
        &self,
        provider_subscription_id: &str,
        next_billing_date: OffsetDateTime,
        invoice: NewInvoice,
    ) -> BillingResult<Invoice> {
        let mut state = self.state.lock().await;

        if state
            .invoices
            .iter()
            .any(|i| i.invoice_number == invoice.invoice_number)
        {
            return Err(BillingError::AlreadyExists(invoice.invoice_number));
        }

        let sub = state.subscription_mut(provider_subscription_id)?;
        sub.next_billing_date = Some(next_billing_date);
        let (subscription_id, user_id) = (sub.id, sub.user_id);

        let record = Invoice {
            id: Uuid::new_v4(),
            user_id,
            subscription_id,
            invoice_number: invoice.invoice_number,
            total_cents: invoice.total_cents,
            status: INVOICE_STATUS_PAID.to_string(),
            paid_at: invoice.paid_at,
        };
        state.invoices.push(record.clone());
        Ok(record)
    }

    async fn hold_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Subscription> {
        let mut state = self.state.lock().await;
        let sub = state.subscription_mut(provider_subscription_id)?;
        sub.status = SubscriptionStatus::OnHold;
        Ok(sub.clone())
    }

    async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
        owner: Uuid,
        cancelled_at: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let mut state = self.state.lock().await;
        let sub = state.subscription_mut(provider_subscription_id)?;
        sub.status = SubscriptionStatus::Cancelled;
        sub.cancelled_at = sub.cancelled_at.or(Some(cancelled_at));
        let updated = sub.clone();

        state.set_tier(owner, FREE_TIER);
        Ok(updated)
    }

    async fn list_invoices(&self, subscription_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let state = self.state.lock().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .iter()
            .filter(|i| i.subscription_id == subscription_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| a.paid_at.cmp(&b.paid_at));
        Ok(invoices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_event(id: &str) -> NewWebhookEvent {
        NewWebhookEvent {
            provider_event_id: id.to_string(),
            event_type: "payment.succeeded".to_string(),
            payload: json!({"payment_id": "pay_1"}),
        }
    }

    fn stub(id: &str) -> SubscriptionStub {
        SubscriptionStub {
            provider_subscription_id: id.to_string(),
            plan_slug: Some("pro".to_string()),
            product_id: None,
            amount_cents: Some(1999),
        }
    }

    #[tokio::test]
    async fn test_duplicate_event_id_is_already_exists() {
        let store = InMemoryBillingStore::new();
        store.create_webhook_event(new_event("evt_1")).await.unwrap();

        let err = store.create_webhook_event(new_event("evt_1")).await.unwrap_err();
        assert!(matches!(err, BillingError::AlreadyExists(_)));
        assert_eq!(store.webhook_event_count().await, 1);
    }

    #[tokio::test]
    async fn test_completion_clears_error() {
        let store = InMemoryBillingStore::new();
        let event = store.create_webhook_event(new_event("evt_1")).await.unwrap();

        store.mark_webhook_failed(event.id, "boom").await.unwrap();
        store.mark_webhook_completed(event.id).await.unwrap();

        let stored = store.get_webhook_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WebhookStatus::Completed);
        assert!(stored.error_message.is_none());
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_replay_refuses_completed_events() {
        let store = InMemoryBillingStore::new();
        let event = store.create_webhook_event(new_event("evt_1")).await.unwrap();
        store.mark_webhook_completed(event.id).await.unwrap();

        assert!(matches!(
            store.reset_webhook_for_replay(event.id).await,
            Err(BillingError::InvalidState(_))
        ));
        assert!(matches!(
            store.reset_webhook_for_replay(Uuid::new_v4()).await,
            Err(BillingError::WebhookEventNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_by_status_and_pages() {
        let store = InMemoryBillingStore::new();
        for i in 0..5 {
            let event = store
                .create_webhook_event(new_event(&format!("evt_{i}")))
                .await
                .unwrap();
            if i % 2 == 0 {
                store.mark_webhook_failed(event.id, "boom").await.unwrap();
            }
        }

        let failed = store
            .list_webhook_events(WebhookEventFilter::new(Some(WebhookStatus::Failed), None, None))
            .await
            .unwrap();
        assert_eq!(failed.len(), 3);

        let page = store
            .list_webhook_events(WebhookEventFilter::new(None, Some(2), Some(4)))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_payment_stub_never_downgrades_active_subscription() {
        let store = InMemoryBillingStore::new();
        let user = store.insert_user("ada@example.com").await;

        let payment = |id: &str| PaymentUpsert {
            user_id: user.id,
            provider_payment_id: id.to_string(),
            amount_cents: 1999,
            currency: Some("USD".to_string()),
        };

        store
            .record_payment(payment("pay_1"), Some(stub("sub_1")))
            .await
            .unwrap();
        store
            .activate_subscription(
                "sub_1",
                user.id,
                SubscriptionActivation {
                    started_at: OffsetDateTime::now_utc(),
                    next_billing_date: None,
                    plan_slug: None,
                    product_id: None,
                    amount_cents: None,
                },
            )
            .await
            .unwrap();

        store
            .record_payment(payment("pay_2"), Some(stub("sub_1")))
            .await
            .unwrap();

        let sub = store.find_subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(store.subscription_count().await, 1);
        assert_eq!(store.payment_count().await, 2);

        let user = store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(user.subscription_tier, "pro");
    }

    #[tokio::test]
    async fn test_activation_leaves_cancelled_subscription_alone() {
        let store = InMemoryBillingStore::new();
        let user = store.insert_user("ada@example.com").await;
        store
            .record_payment(
                PaymentUpsert {
                    user_id: user.id,
                    provider_payment_id: "pay_1".to_string(),
                    amount_cents: 1999,
                    currency: None,
                },
                Some(stub("sub_1")),
            )
            .await
            .unwrap();
        store
            .cancel_subscription("sub_1", user.id, OffsetDateTime::now_utc())
            .await
            .unwrap();

        let sub = store
            .activate_subscription(
                "sub_1",
                user.id,
                SubscriptionActivation {
                    started_at: OffsetDateTime::now_utc(),
                    next_billing_date: None,
                    plan_slug: Some("business".to_string()),
                    product_id: None,
                    amount_cents: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
        assert!(sub.cancelled_at.is_some());
        let user = store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(user.subscription_tier, "free");
    }

    #[tokio::test]
    async fn test_lifecycle_updates_require_subscription() {
        let store = InMemoryBillingStore::new();

        assert!(matches!(
            store.hold_subscription("sub_missing").await,
            Err(BillingError::SubscriptionNotFound(_))
        ));
        assert!(matches!(
            store
                .cancel_subscription("sub_missing", Uuid::new_v4(), OffsetDateTime::now_utc())
                .await,
            Err(BillingError::SubscriptionNotFound(_))
        ));
    }
}
