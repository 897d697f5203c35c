//! Billing errors

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors raised by the webhook pipeline and the reconciler
#[derive(Error, Debug)]
pub enum BillingError {
    /// A required webhook header was absent or not valid UTF-8
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    /// Signature mismatch or stale timestamp. Deliberately carries no detail.
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// Body is not a `{id, type, data.object}` envelope
    #[error("invalid webhook envelope: {0}")]
    InvalidEnvelope(String),

    /// `data.object` does not match the schema registered for its type
    #[error("invalid {event_type} payload: {message}")]
    InvalidEventPayload { event_type: String, message: String },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Neither event metadata nor the customer mapping names a user
    #[error("could not resolve owning user for {0}")]
    UnresolvedUser(String),

    /// Lifecycle event arrived before the subscription row exists
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("webhook event not found: {0}")]
    WebhookEventNotFound(String),

    /// Unique constraint violation on insert
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("email error: {0}")]
    Email(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether another attempt may succeed.
    ///
    /// Missing rows caused by out-of-order delivery and infrastructure
    /// failures are retryable. Malformed business data and users that cannot
    /// be resolved will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SubscriptionNotFound(_)
            | Self::WebhookEventNotFound(_)
            | Self::Database(_)
            | Self::Queue(_)
            | Self::Email(_)
            | Self::Internal(_) => true,
            Self::MissingHeader(_)
            | Self::InvalidSignature
            | Self::InvalidEnvelope(_)
            | Self::InvalidEventPayload { .. }
            | Self::InvalidAmount(_)
            | Self::UnresolvedUser(_)
            | Self::AlreadyExists(_)
            | Self::InvalidState(_)
            | Self::Config(_) => false,
        }
    }

    /// Client or protocol error at the ingestion boundary (HTTP 4xx)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MissingHeader(_)
                | Self::InvalidSignature
                | Self::InvalidEnvelope(_)
                | Self::InvalidEventPayload { .. }
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Internal(format!("serialization failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_hazard_is_retryable() {
        assert!(BillingError::SubscriptionNotFound("sub_1".into()).is_retryable());
        assert!(BillingError::Database("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_bad_business_data_is_permanent() {
        assert!(!BillingError::UnresolvedUser("pay_1".into()).is_retryable());
        assert!(!BillingError::InvalidAmount("-1".into()).is_retryable());
        assert!(!BillingError::InvalidEventPayload {
            event_type: "payment.succeeded".into(),
            message: "unknown field".into(),
        }
        .is_retryable());
    }
}
