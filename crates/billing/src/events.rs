//! Typed billing events
//!
//! Each event type the reconciler understands has a strict payload schema:
//! unknown fields are rejected so handlers never run on a shape they were not
//! written for. Anything else becomes [`BillingEvent::Unknown`] and is stored
//! but never dispatched.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::amount::RawAmount;
use crate::error::{BillingError, BillingResult};

/// Event types with a registered schema and handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PaymentSucceeded,
    SubscriptionActive,
    SubscriptionRenewed,
    SubscriptionOnHold,
    SubscriptionCancelled,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::PaymentSucceeded,
        EventKind::SubscriptionActive,
        EventKind::SubscriptionRenewed,
        EventKind::SubscriptionOnHold,
        EventKind::SubscriptionCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PaymentSucceeded => "payment.succeeded",
            EventKind::SubscriptionActive => "subscription.active",
            EventKind::SubscriptionRenewed => "subscription.renewed",
            EventKind::SubscriptionOnHold => "subscription.on_hold",
            EventKind::SubscriptionCancelled => "subscription.cancelled",
        }
    }

    pub fn from_type(event_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == event_type)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomerRef {
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Metadata attached at checkout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventMetadata {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub plan_slug: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub checkout_session_id: Option<String>,
}

/// `data.object` of `payment.succeeded`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaymentPayload {
    pub payment_id: String,
    pub amount: RawAmount,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub customer: Option<CustomerRef>,
    #[serde(default)]
    pub metadata: Option<EventMetadata>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

/// `data.object` shared by every `subscription.*` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionPayload {
    pub subscription_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub plan_slug: Option<String>,
    #[serde(default)]
    pub amount: Option<RawAmount>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub customer: Option<CustomerRef>,
    #[serde(default)]
    pub metadata: Option<EventMetadata>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_billing_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
}

/// A decoded event, one variant per handler
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    PaymentSucceeded(PaymentPayload),
    SubscriptionActive(SubscriptionPayload),
    SubscriptionRenewed(SubscriptionPayload),
    SubscriptionOnHold(SubscriptionPayload),
    SubscriptionCancelled(SubscriptionPayload),
    /// Accepted for audit, never dispatched
    Unknown { event_type: String },
}

impl BillingEvent {
    /// Decode `data.object` against the schema registered for `event_type`.
    ///
    /// Types without a schema are accepted as [`BillingEvent::Unknown`]
    /// whatever the object looks like.
    pub fn parse(event_type: &str, object: &serde_json::Value) -> BillingResult<Self> {
        let Some(kind) = EventKind::from_type(event_type) else {
            return Ok(BillingEvent::Unknown {
                event_type: event_type.to_string(),
            });
        };

        let invalid = |e: serde_json::Error| BillingError::InvalidEventPayload {
            event_type: event_type.to_string(),
            message: e.to_string(),
        };

        let event = match kind {
            EventKind::PaymentSucceeded => {
                BillingEvent::PaymentSucceeded(PaymentPayload::deserialize(object).map_err(invalid)?)
            }
            EventKind::SubscriptionActive => BillingEvent::SubscriptionActive(
                SubscriptionPayload::deserialize(object).map_err(invalid)?,
            ),
            EventKind::SubscriptionRenewed => BillingEvent::SubscriptionRenewed(
                SubscriptionPayload::deserialize(object).map_err(invalid)?,
            ),
            EventKind::SubscriptionOnHold => BillingEvent::SubscriptionOnHold(
                SubscriptionPayload::deserialize(object).map_err(invalid)?,
            ),
            EventKind::SubscriptionCancelled => BillingEvent::SubscriptionCancelled(
                SubscriptionPayload::deserialize(object).map_err(invalid)?,
            ),
        };
        Ok(event)
    }

    pub fn kind(&self) -> Option<EventKind> {
        match self {
            BillingEvent::PaymentSucceeded(_) => Some(EventKind::PaymentSucceeded),
            BillingEvent::SubscriptionActive(_) => Some(EventKind::SubscriptionActive),
            BillingEvent::SubscriptionRenewed(_) => Some(EventKind::SubscriptionRenewed),
            BillingEvent::SubscriptionOnHold(_) => Some(EventKind::SubscriptionOnHold),
            BillingEvent::SubscriptionCancelled(_) => Some(EventKind::SubscriptionCancelled),
            BillingEvent::Unknown { .. } => None,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            BillingEvent::Unknown { event_type } => event_type,
            other => other.kind().map(|k| k.as_str()).unwrap_or_default(),
        }
    }
}

impl EventMetadata {
    /// Explicit owner id, if one was attached at checkout
    pub fn user_id(&self) -> BillingResult<Option<Uuid>> {
        match self.user_id.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => Uuid::parse_str(raw).map(Some).map_err(|_| {
                BillingError::InvalidEventPayload {
                    event_type: "metadata".to_string(),
                    message: format!("metadata.user_id '{raw}' is not a UUID"),
                }
            }),
        }
    }
}

fn require_id(event_type: EventKind, field: &str, value: &str) -> BillingResult<()> {
    if value.trim().is_empty() {
        return Err(BillingError::InvalidEventPayload {
            event_type: event_type.to_string(),
            message: format!("{field} must not be empty"),
        });
    }
    Ok(())
}

impl PaymentPayload {
    /// Handler-side checks beyond the wire schema
    pub fn validate(&self) -> BillingResult<i64> {
        let kind = EventKind::PaymentSucceeded;
        require_id(kind, "payment_id", &self.payment_id)?;
        if let Some(sub) = &self.subscription_id {
            require_id(kind, "subscription_id", sub)?;
        }
        self.metadata().user_id()?;
        self.amount.to_cents()
    }

    pub fn metadata(&self) -> EventMetadata {
        self.metadata.clone().unwrap_or_default()
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer
            .as_ref()
            .and_then(|c| c.customer_id.as_deref())
            .filter(|id| !id.trim().is_empty())
    }

    pub fn customer_email(&self) -> Option<&str> {
        self.customer.as_ref().and_then(|c| c.email.as_deref())
    }

    /// Plan slug from metadata, the only place checkout records it
    pub fn plan_slug(&self) -> Option<String> {
        self.metadata.as_ref().and_then(|m| m.plan_slug.clone())
    }

    pub fn product_id(&self) -> Option<String> {
        self.product_id
            .clone()
            .or_else(|| self.metadata.as_ref().and_then(|m| m.product_id.clone()))
    }
}

impl SubscriptionPayload {
    /// Handler-side checks beyond the wire schema
    pub fn validate(&self, kind: EventKind) -> BillingResult<()> {
        require_id(kind, "subscription_id", &self.subscription_id)?;
        self.metadata().user_id()?;
        if let Some(amount) = &self.amount {
            amount.to_cents()?;
        }
        if let (Some(start), Some(end)) = (self.current_period_start, self.current_period_end) {
            if end < start {
                return Err(BillingError::InvalidEventPayload {
                    event_type: kind.to_string(),
                    message: "current_period_end precedes current_period_start".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn metadata(&self) -> EventMetadata {
        self.metadata.clone().unwrap_or_default()
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer
            .as_ref()
            .and_then(|c| c.customer_id.as_deref())
            .filter(|id| !id.trim().is_empty())
    }

    pub fn customer_email(&self) -> Option<&str> {
        self.customer.as_ref().and_then(|c| c.email.as_deref())
    }

    pub fn plan_slug(&self) -> Option<String> {
        self.plan_slug
            .clone()
            .or_else(|| self.metadata.as_ref().and_then(|m| m.plan_slug.clone()))
    }

    pub fn product_id(&self) -> Option<String> {
        self.product_id
            .clone()
            .or_else(|| self.metadata.as_ref().and_then(|m| m.product_id.clone()))
    }

    pub fn amount_cents(&self) -> BillingResult<Option<i64>> {
        self.amount.as_ref().map(RawAmount::to_cents).transpose()
    }

    /// Next charge date: explicit field first, else the end of the period
    pub fn next_billing_date(&self) -> Option<OffsetDateTime> {
        self.next_billing_date.or(self.current_period_end)
    }
}
