//! Postgres-backed billing store

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{BillingStore, WebhookEventFilter};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    Invoice, NewInvoice, NewWebhookEvent, Payment, PaymentUpsert, Subscription,
    SubscriptionActivation, SubscriptionStatus, SubscriptionStub, User, WebhookEvent,
    INVOICE_STATUS_PAID, PAYMENT_STATUS_SUCCEEDED,
};
use recap_shared::FREE_TIER;

const WEBHOOK_EVENT_COLUMNS: &str = "id, provider_event_id, event_type, status, payload, \
     processed_at, error_message, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, provider_subscription_id, plan_slug, \
     product_id, amount_cents, status, started_at, next_billing_date, cancelled_at";

const PAYMENT_COLUMNS: &str =
    "id, user_id, provider_payment_id, amount_cents, currency, status, subscription_id, processed_at";

const INVOICE_COLUMNS: &str =
    "id, user_id, subscription_id, invoice_number, total_cents, status, paid_at";

#[derive(sqlx::FromRow)]
struct WebhookEventRow {
    id: Uuid,
    provider_event_id: String,
    event_type: String,
    status: String,
    payload: serde_json::Value,
    processed_at: Option<OffsetDateTime>,
    error_message: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<WebhookEventRow> for WebhookEvent {
    type Error = BillingError;

    fn try_from(row: WebhookEventRow) -> BillingResult<Self> {
        Ok(WebhookEvent {
            id: row.id,
            provider_event_id: row.provider_event_id,
            event_type: row.event_type,
            status: row.status.parse()?,
            payload: row.payload,
            processed_at: row.processed_at,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    provider_subscription_id: String,
    plan_slug: Option<String>,
    product_id: Option<String>,
    amount_cents: Option<i64>,
    status: String,
    started_at: Option<OffsetDateTime>,
    next_billing_date: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            provider_subscription_id: row.provider_subscription_id,
            plan_slug: row.plan_slug,
            product_id: row.product_id,
            amount_cents: row.amount_cents,
            status: row.status.parse()?,
            started_at: row.started_at,
            next_billing_date: row.next_billing_date,
            cancelled_at: row.cancelled_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Uuid,
    provider_payment_id: String,
    amount_cents: i64,
    currency: Option<String>,
    status: String,
    subscription_id: Option<Uuid>,
    processed_at: OffsetDateTime,
}

impl From<PaymentRow> for Payment {
    fn from(row: PaymentRow) -> Self {
        Payment {
            id: row.id,
            user_id: row.user_id,
            provider_payment_id: row.provider_payment_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status: row.status,
            subscription_id: row.subscription_id,
            processed_at: row.processed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    user_id: Uuid,
    subscription_id: Uuid,
    invoice_number: String,
    total_cents: i64,
    status: String,
    paid_at: OffsetDateTime,
}

impl From<InvoiceRow> for Invoice {
    fn from(row: InvoiceRow) -> Self {
        Invoice {
            id: row.id,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            invoice_number: row.invoice_number,
            total_cents: row.total_cents,
            status: row.status,
            paid_at: row.paid_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    subscription_tier: String,
}

/// Billing store over the shared Postgres pool
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

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn find_webhook_event(
        &self,
        provider_event_id: &str,
    ) -> BillingResult<Option<WebhookEvent>> {
        let row: Option<WebhookEventRow> = sqlx::query_as(&format!(
            "SELECT {WEBHOOK_EVENT_COLUMNS} FROM webhook_events WHERE provider_event_id = $1"
        ))
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookEvent::try_from).transpose()
    }

    async fn get_webhook_event(&self, id: Uuid) -> BillingResult<Option<WebhookEvent>> {
        let row: Option<WebhookEventRow> = sqlx::query_as(&format!(
            "SELECT {WEBHOOK_EVENT_COLUMNS} FROM webhook_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookEvent::try_from).transpose()
    }

    async fn create_webhook_event(&self, event: NewWebhookEvent) -> BillingResult<WebhookEvent> {
        let result: Result<WebhookEventRow, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            INSERT INTO webhook_events (id, provider_event_id, event_type, status, payload)
            VALUES ($1, $2, $3, 'received', $4)
            RETURNING {WEBHOOK_EVENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&event.provider_event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => row.try_into(),
            Err(e) if is_unique_violation(&e) => {
                Err(BillingError::AlreadyExists(event.provider_event_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_webhook_completed(&self, id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'completed', processed_at = NOW(), error_message = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::WebhookEventNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn mark_webhook_failed(&self, id: Uuid, error_message: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::WebhookEventNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn reset_webhook_for_replay(&self, id: Uuid) -> BillingResult<WebhookEvent> {
        let row: Option<WebhookEventRow> = sqlx::query_as(&format!(
            r#"
            UPDATE webhook_events
            SET status = 'received', error_message = NULL, processed_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status <> 'completed'
            RETURNING {WEBHOOK_EVENT_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => match self.get_webhook_event(id).await? {
                Some(_) => Err(BillingError::InvalidState(format!(
                    "webhook event {id} already completed"
                ))),
                None => Err(BillingError::WebhookEventNotFound(id.to_string())),
            },
        }
    }

    async fn list_webhook_events(
        &self,
        filter: WebhookEventFilter,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {WEBHOOK_EVENT_COLUMNS}
            FROM webhook_events
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookEvent::try_from).collect()
    }

    async fn list_stale_received_events(
        &self,
        older_than: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {WEBHOOK_EVENT_COLUMNS}
            FROM webhook_events
            WHERE status = 'received' AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookEvent::try_from).collect()
    }

    async fn get_user(&self, id: Uuid) -> BillingResult<Option<User>> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, email, subscription_tier FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| User {
            id: r.id,
            email: r.email,
            subscription_tier: r.subscription_tier,
        }))
    }

    async fn resolve_customer(&self, provider_customer_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM billing_customers WHERE provider_customer_id = $1",
        )
        .bind(provider_customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(user_id,)| user_id))
    }

    async fn link_customer(&self, provider_customer_id: &str, user_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_customers (provider_customer_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (provider_customer_id)
            DO UPDATE SET user_id = EXCLUDED.user_id, updated_at = NOW()
            "#,
        )
        .bind(provider_customer_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_payment(
        &self,
        payment: PaymentUpsert,
        stub: Option<SubscriptionStub>,
    ) -> BillingResult<Payment> {
        let mut tx = self.pool.begin().await?;

        let subscription_id = match stub {
            Some(stub) => {
                // Fills gaps on an existing row but never touches its status
                let (id,): (Uuid,) = sqlx::query_as(
                    r#"
                    INSERT INTO subscriptions
                        (id, user_id, provider_subscription_id, plan_slug, product_id, amount_cents, status)
                    VALUES ($1, $2, $3, $4, $5, $6, 'pending')
                    ON CONFLICT (provider_subscription_id) DO UPDATE SET
                        plan_slug = COALESCE(subscriptions.plan_slug, EXCLUDED.plan_slug),
                        product_id = COALESCE(subscriptions.product_id, EXCLUDED.product_id),
                        amount_cents = COALESCE(subscriptions.amount_cents, EXCLUDED.amount_cents),
                        updated_at = NOW()
                    RETURNING id
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(payment.user_id)
                .bind(&stub.provider_subscription_id)
                .bind(&stub.plan_slug)
                .bind(&stub.product_id)
                .bind(stub.amount_cents)
                .fetch_one(&mut *tx)
                .await?;
                Some(id)
            }
            None => None,
        };

        let row: PaymentRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO payments
                (id, user_id, provider_payment_id, amount_cents, currency, status, subscription_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (provider_payment_id) DO UPDATE SET
                amount_cents = EXCLUDED.amount_cents,
                currency = COALESCE(EXCLUDED.currency, payments.currency),
                subscription_id = COALESCE(EXCLUDED.subscription_id, payments.subscription_id),
                updated_at = NOW()
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(payment.user_id)
        .bind(&payment.provider_payment_id)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(PAYMENT_STATUS_SUCCEEDED)
        .bind(subscription_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn find_payment(&self, provider_payment_id: &str) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE provider_payment_id = $1"
        ))
        .bind(provider_payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Payment::from))
    }

    async fn find_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE provider_subscription_id = $1"
        ))
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn activate_subscription(
        &self,
        provider_subscription_id: &str,
        owner: Uuid,
        activation: SubscriptionActivation,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                status = $2,
                started_at = COALESCE(started_at, $3),
                next_billing_date = COALESCE($4, next_billing_date),
                plan_slug = COALESCE($5, plan_slug),
                product_id = COALESCE($6, product_id),
                amount_cents = COALESCE($7, amount_cents),
                updated_at = NOW()
            WHERE provider_subscription_id = $1 AND status <> $8
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(provider_subscription_id)
        .bind(SubscriptionStatus::Active.as_str())
        .bind(activation.started_at)
        .bind(activation.next_billing_date)
        .bind(&activation.plan_slug)
        .bind(&activation.product_id)
        .bind(activation.amount_cents)
        .bind(SubscriptionStatus::Cancelled.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            // Either missing or cancelled; a cancelled row is returned as is
            let existing: Option<SubscriptionRow> = sqlx::query_as(&format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE provider_subscription_id = $1"
            ))
            .bind(provider_subscription_id)
            .fetch_optional(&mut *tx)
            .await?;
            tx.commit().await?;

            return match existing {
                Some(row) => row.try_into(),
                None => Err(BillingError::SubscriptionNotFound(
                    provider_subscription_id.to_string(),
                )),
            };
        };

        if let Some(plan) = &row.plan_slug {
            sqlx::query(
                "UPDATE users SET subscription_tier = $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(plan)
            .bind(owner)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        row.try_into()
    }

    async fn renew_subscription(
        &self,
        provider_subscription_id: &str,
        next_billing_date: OffsetDateTime,
        invoice: NewInvoice,
    ) -> BillingResult<Invoice> {
        let mut tx = self.pool.begin().await?;

        let sub: Option<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET next_billing_date = $2, updated_at = NOW()
            WHERE provider_subscription_id = $1
            RETURNING id, user_id
            "#,
        )
        .bind(provider_subscription_id)
        .bind(next_billing_date)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((subscription_id, user_id)) = sub else {
            return Err(BillingError::SubscriptionNotFound(
                provider_subscription_id.to_string(),
            ));
        };

        let row: InvoiceRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO invoices (id, user_id, subscription_id, invoice_number, total_cents, status, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(subscription_id)
        .bind(&invoice.invoice_number)
        .bind(invoice.total_cents)
        .bind(INVOICE_STATUS_PAID)
        .bind(invoice.paid_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn hold_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Subscription> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET status = $2, updated_at = NOW()
            WHERE provider_subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(provider_subscription_id)
        .bind(SubscriptionStatus::OnHold.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| BillingError::SubscriptionNotFound(provider_subscription_id.to_string()))?
            .try_into()
    }

    async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
        owner: Uuid,
        cancelled_at: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                status = $2,
                cancelled_at = COALESCE(cancelled_at, $3),
                updated_at = NOW()
            WHERE provider_subscription_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(provider_subscription_id)
        .bind(SubscriptionStatus::Cancelled.as_str())
        .bind(cancelled_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(BillingError::SubscriptionNotFound(
                provider_subscription_id.to_string(),
            ));
        };

        sqlx::query("UPDATE users SET subscription_tier = $1, updated_at = NOW() WHERE id = $2")
            .bind(FREE_TIER)
            .bind(owner)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn list_invoices(&self, subscription_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE subscription_id = $1 ORDER BY paid_at ASC"
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Invoice::from).collect())
    }
}
