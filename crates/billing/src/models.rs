//! Billing records read and written by the pipeline

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// Processing status of an accepted webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Received,
    Completed,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Received => "received",
            WebhookStatus::Completed => "completed",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WebhookStatus::Received)
    }
}

impl std::fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WebhookStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(WebhookStatus::Received),
            "completed" => Ok(WebhookStatus::Completed),
            "failed" => Ok(WebhookStatus::Failed),
            other => Err(BillingError::Internal(format!(
                "unknown webhook status '{other}'"
            ))),
        }
    }
}

/// One accepted, de-duplicated inbound event
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    /// Canonical idempotency key
    pub provider_event_id: String,
    pub event_type: String,
    pub status: WebhookStatus,
    /// Validated `data.object`, stored verbatim
    pub payload: serde_json::Value,
    pub processed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub provider_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    OnHold,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::OnHold => "on_hold",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubscriptionStatus::Pending),
            "active" => Ok(SubscriptionStatus::Active),
            "on_hold" => Ok(SubscriptionStatus::OnHold),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(BillingError::Internal(format!(
                "unknown subscription status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_subscription_id: String,
    pub plan_slug: Option<String>,
    pub product_id: Option<String>,
    pub amount_cents: Option<i64>,
    pub status: SubscriptionStatus,
    pub started_at: Option<OffsetDateTime>,
    pub next_billing_date: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
}

/// Minimal subscription row created from a payment before its own
/// lifecycle event arrives
#[derive(Debug, Clone)]
pub struct SubscriptionStub {
    pub provider_subscription_id: String,
    pub plan_slug: Option<String>,
    pub product_id: Option<String>,
    pub amount_cents: Option<i64>,
}

/// Field updates applied on `subscription.active`
#[derive(Debug, Clone)]
pub struct SubscriptionActivation {
    pub started_at: OffsetDateTime,
    pub next_billing_date: Option<OffsetDateTime>,
    pub plan_slug: Option<String>,
    pub product_id: Option<String>,
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_payment_id: String,
    pub amount_cents: i64,
    pub currency: Option<String>,
    pub status: String,
    pub subscription_id: Option<Uuid>,
    pub processed_at: OffsetDateTime,
}

/// Upsert keyed by `provider_payment_id`
#[derive(Debug, Clone)]
pub struct PaymentUpsert {
    pub user_id: Uuid,
    pub provider_payment_id: String,
    pub amount_cents: i64,
    pub currency: Option<String>,
}

pub const PAYMENT_STATUS_SUCCEEDED: &str = "succeeded";
pub const INVOICE_STATUS_PAID: &str = "paid";

#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_number: String,
    pub total_cents: i64,
    pub status: String,
    pub paid_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub invoice_number: String,
    pub total_cents: i64,
    pub paid_at: OffsetDateTime,
}

/// The slice of the application's user record the pipeline touches
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub subscription_tier: String,
}

/// Generate a human-referenceable invoice number, e.g. `INV-20250114-9F3A61C2`
pub fn generate_invoice_number(issued_at: OffsetDateTime) -> String {
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!(
        "INV-{:04}{:02}{:02}-{}",
        issued_at.year(),
        u8::from(issued_at.month()),
        issued_at.day(),
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_status_round_trip_through_text() {
        for status in [
            WebhookStatus::Received,
            WebhookStatus::Completed,
            WebhookStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<WebhookStatus>().unwrap(), status);
        }
        assert!("processing".parse::<WebhookStatus>().is_err());
        assert_eq!(
            "on_hold".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::OnHold
        );
    }

    #[test]
    fn test_invoice_numbers_are_dated_and_unique() {
        let at = datetime!(2025-01-14 10:00 UTC);
        let a = generate_invoice_number(at);
        let b = generate_invoice_number(at);

        assert!(a.starts_with("INV-20250114-"));
        assert_eq!(a.len(), "INV-20250114-".len() + 8);
        assert_ne!(a, b);
    }
}
