//! Event handlers
//!
//! One handler per [`BillingEvent`] variant. Handlers are safe to re-run:
//! writes are keyed by the provider's own ids, and the only append
//! (renewal invoices) is a new billing event by definition.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::{EmailSender, EmailTemplate};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, EventKind, PaymentPayload, SubscriptionPayload};
use crate::models::{
    generate_invoice_number, NewInvoice, PaymentUpsert, Subscription, SubscriptionActivation,
    SubscriptionStatus, SubscriptionStub,
};
use crate::store::BillingStore;

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn BillingStore>,
    email: Arc<dyn EmailSender>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn BillingStore>, email: Arc<dyn EmailSender>) -> Self {
        Self { store, email }
    }

    /// Decode and apply one stored event
    pub async fn apply(&self, event_type: &str, payload: &serde_json::Value) -> BillingResult<()> {
        match BillingEvent::parse(event_type, payload)? {
            BillingEvent::PaymentSucceeded(p) => self.handle_payment_succeeded(&p).await,
            BillingEvent::SubscriptionActive(p) => self.handle_subscription_active(&p).await,
            BillingEvent::SubscriptionRenewed(p) => self.handle_subscription_renewed(&p).await,
            BillingEvent::SubscriptionOnHold(p) => self.handle_subscription_on_hold(&p).await,
            BillingEvent::SubscriptionCancelled(p) => self.handle_subscription_cancelled(&p).await,
            BillingEvent::Unknown { event_type } => {
                tracing::info!(event_type = %event_type, "No handler for event type, acknowledging");
                Ok(())
            }
        }
    }

    async fn handle_payment_succeeded(&self, p: &PaymentPayload) -> BillingResult<()> {
        let amount_cents = p.validate()?;

        let explicit_user = p.metadata().user_id()?;
        let user_id = match explicit_user {
            Some(id) => id,
            None => match p.customer_id() {
                Some(customer_id) => self
                    .store
                    .resolve_customer(customer_id)
                    .await?
                    .ok_or_else(|| unresolved(&p.payment_id))?,
                None => return Err(unresolved(&p.payment_id)),
            },
        };

        let Some(user) = self.store.get_user(user_id).await? else {
            return Err(unresolved(&p.payment_id));
        };

        if let (Some(_), Some(customer_id)) = (explicit_user, p.customer_id()) {
            self.store.link_customer(customer_id, user_id).await?;
        }

        let first_delivery = self.store.find_payment(&p.payment_id).await?.is_none();

        let stub = p.subscription_id.as_ref().map(|sid| SubscriptionStub {
            provider_subscription_id: sid.clone(),
            plan_slug: p.plan_slug(),
            product_id: p.product_id(),
            amount_cents: Some(amount_cents),
        });

        let payment = self
            .store
            .record_payment(
                PaymentUpsert {
                    user_id,
                    provider_payment_id: p.payment_id.clone(),
                    amount_cents,
                    currency: p.currency.clone(),
                },
                stub,
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            payment_id = %payment.provider_payment_id,
            amount_cents = payment.amount_cents,
            subscription_id = ?p.subscription_id,
            "Payment recorded"
        );

        if first_delivery {
            let to = p.customer_email().unwrap_or(&user.email);
            let template = EmailTemplate::PaymentReceived {
                payment_id: payment.provider_payment_id.clone(),
                amount_cents: payment.amount_cents,
                currency: payment.currency.clone(),
            };
            self.notify(to, &template).await;
        }

        Ok(())
    }

    async fn handle_subscription_active(&self, p: &SubscriptionPayload) -> BillingResult<()> {
        p.validate(EventKind::SubscriptionActive)?;
        let sub = self.require_subscription(&p.subscription_id).await?;
        if sub.status == SubscriptionStatus::Cancelled {
            tracing::warn!(
                subscription_id = %p.subscription_id,
                "Ignoring activation of cancelled subscription"
            );
            return Ok(());
        }
        let owner = self.resolve_owner(p, &sub).await?;

        let activation = SubscriptionActivation {
            started_at: p
                .current_period_start
                .unwrap_or_else(OffsetDateTime::now_utc),
            next_billing_date: p.next_billing_date(),
            plan_slug: p.plan_slug(),
            product_id: p.product_id(),
            amount_cents: p.amount_cents()?,
        };

        let updated = self
            .store
            .activate_subscription(&p.subscription_id, owner, activation)
            .await?;
        if updated.status == SubscriptionStatus::Cancelled {
            tracing::warn!(
                subscription_id = %p.subscription_id,
                "Subscription cancelled concurrently, activation ignored"
            );
            return Ok(());
        }

        tracing::info!(
            user_id = %owner,
            subscription_id = %p.subscription_id,
            plan = ?updated.plan_slug,
            "Subscription activated"
        );

        if sub.status != SubscriptionStatus::Active {
            if let Some(user) = self.store.get_user(owner).await? {
                let to = p.customer_email().unwrap_or(&user.email);
                let template = EmailTemplate::SubscriptionActivated {
                    plan: updated.plan_slug.clone(),
                    next_billing_date: updated.next_billing_date,
                };
                self.notify(to, &template).await;
            }
        }

        Ok(())
    }

    async fn handle_subscription_renewed(&self, p: &SubscriptionPayload) -> BillingResult<()> {
        p.validate(EventKind::SubscriptionRenewed)?;
        let next_billing_date =
            p.next_billing_date()
                .ok_or_else(|| BillingError::InvalidEventPayload {
                    event_type: EventKind::SubscriptionRenewed.to_string(),
                    message: "next_billing_date or current_period_end is required".to_string(),
                })?;

        let sub = self.require_subscription(&p.subscription_id).await?;

        let paid_at = p
            .current_period_start
            .unwrap_or_else(OffsetDateTime::now_utc);
        let total_cents = p.amount_cents()?.or(sub.amount_cents).unwrap_or(0);

        let invoice = self
            .store
            .renew_subscription(
                &p.subscription_id,
                next_billing_date,
                NewInvoice {
                    invoice_number: generate_invoice_number(paid_at),
                    total_cents,
                    paid_at,
                },
            )
            .await?;

        tracing::info!(
            subscription_id = %p.subscription_id,
            invoice_number = %invoice.invoice_number,
            total_cents = invoice.total_cents,
            "Subscription renewed"
        );
        Ok(())
    }

    async fn handle_subscription_on_hold(&self, p: &SubscriptionPayload) -> BillingResult<()> {
        p.validate(EventKind::SubscriptionOnHold)?;
        self.store.hold_subscription(&p.subscription_id).await?;

        tracing::warn!(subscription_id = %p.subscription_id, "Subscription on hold");
        Ok(())
    }

    async fn handle_subscription_cancelled(&self, p: &SubscriptionPayload) -> BillingResult<()> {
        p.validate(EventKind::SubscriptionCancelled)?;
        let sub = self.require_subscription(&p.subscription_id).await?;
        let owner = self.resolve_owner(p, &sub).await?;

        let cancelled_at = p.cancelled_at.unwrap_or_else(OffsetDateTime::now_utc);
        self.store
            .cancel_subscription(&p.subscription_id, owner, cancelled_at)
            .await?;

        tracing::info!(
            user_id = %owner,
            subscription_id = %p.subscription_id,
            "Subscription cancelled, user downgraded to free tier"
        );
        Ok(())
    }

    async fn require_subscription(&self, provider_subscription_id: &str) -> BillingResult<Subscription> {
        self.store
            .find_subscription(provider_subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(provider_subscription_id.to_string()))
    }

    /// Metadata first, then the customer mapping, then the row's own owner
    async fn resolve_owner(&self, p: &SubscriptionPayload, sub: &Subscription) -> BillingResult<Uuid> {
        if let Some(id) = p.metadata().user_id()? {
            return Ok(id);
        }
        if let Some(customer_id) = p.customer_id() {
            if let Some(id) = self.store.resolve_customer(customer_id).await? {
                return Ok(id);
            }
        }
        Ok(sub.user_id)
    }

    async fn notify(&self, to: &str, template: &EmailTemplate) {
        if let Err(e) = self.email.send(to, template).await {
            tracing::error!(
                template = template.name(),
                error = %e,
                "Failed to send billing email"
            );
        }
    }
}

fn unresolved(payment_id: &str) -> BillingError {
    BillingError::UnresolvedUser(format!("payment {payment_id}"))
}
