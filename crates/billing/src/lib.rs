// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::InvalidEventPayload carries two strings
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Recap Billing Module
//!
//! Ingests signed payment-provider webhooks and reconciles them into
//! subscription, payment, invoice and user-tier state.
//!
//! ## Pipeline
//!
//! - **Ingestion**: delivery-id dedup, signature check, envelope and
//!   payload validation, canonical-id dedup, persist, enqueue
//! - **Queue**: durable at-least-once jobs with exponential backoff
//! - **Reconciler**: one idempotent handler per event type
//! - **Processor**: worker-side bookkeeping of `completed` / `failed`
//! - **Email**: best-effort payment and activation notifications

pub mod amount;
pub mod email;
pub mod envelope;
pub mod error;
pub mod events;
pub mod ingest;
pub mod models;
pub mod processor;
pub mod queue;
pub mod reconciler;
pub mod signature;
pub mod store;


// Amounts
pub use amount::{RawAmount, MAJOR_UNIT_THRESHOLD};

// Email
pub use email::{BillingEmailService, EmailConfig, EmailSender, EmailTemplate};

// Envelope and events
pub use envelope::Envelope;
pub use events::{BillingEvent, EventKind, PaymentPayload, SubscriptionPayload};

// Error
pub use error::{BillingError, BillingResult};

// Ingestion
pub use ingest::{IngestOutcome, WebhookIngestor};

// Models
pub use models::{
    Invoice, Payment, Subscription, SubscriptionStatus, User, WebhookEvent, WebhookStatus,
};

// Processing
pub use processor::{JobProcessor, ProcessOutcome};
pub use reconciler::Reconciler;

// Queue
pub use queue::{InMemoryJobQueue, JobOptions, JobQueue, PgJobQueue, ReservedJob, WebhookJob};

// Signature
pub use signature::{
    SignatureVerifier, WebhookHeaders, DEFAULT_TOLERANCE, HEADER_WEBHOOK_ID,
    HEADER_WEBHOOK_SIGNATURE, HEADER_WEBHOOK_TIMESTAMP,
};

// Store
pub use store::{BillingStore, InMemoryBillingStore, PgBillingStore, WebhookEventFilter};
