//! Durable at-least-once dispatch queue
//!
//! Ingestion enqueues one [`WebhookJob`] per accepted event and returns; the
//! worker reserves jobs under a lease, runs them, then acknowledges, retries
//! with exponential backoff, or buries them. A reservation whose lease runs
//! out (worker crash) is handed out again, so a job can run more than once.

mod memory;
mod postgres;

pub use memory::InMemoryJobQueue;
pub use postgres::PgJobQueue;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Job body, serialized as `{"eventId", "eventType", "payload"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookJob {
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Total runs allowed, including the first
    pub attempts: u32,
    /// Exponential backoff base
    pub backoff_delay: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_delay: Duration::from_millis(2000),
        }
    }
}

/// `base * 2^(attempt - 1)`: with a 2 s base, 2 s after the first failure,
/// 4 s after the second
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

/// A job handed to a worker under a lease
#[derive(Debug, Clone)]
pub struct ReservedJob {
    pub id: Uuid,
    pub job: WebhookJob,
    /// Runs so far, counting this one
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_delay: Duration,
}

impl ReservedJob {
    pub fn is_last_attempt(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    pub fn next_delay(&self) -> Duration {
        backoff_delay(self.backoff_delay, self.attempts_made)
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns the job id
    async fn enqueue(&self, job: WebhookJob, options: JobOptions) -> BillingResult<Uuid>;

    /// Claim the next ready job, or an expired reservation, for `lease`
    async fn reserve(&self, lease: Duration) -> BillingResult<Option<ReservedJob>>;

    /// The job ran to completion
    async fn ack(&self, job_id: Uuid) -> BillingResult<()>;

    /// Release the job to run again after `delay`
    async fn retry(&self, job_id: Uuid, delay: Duration, error: &str) -> BillingResult<()>;

    /// Stop retrying. The row stays as a dead letter until purged.
    async fn bury(&self, job_id: Uuid, error: &str) -> BillingResult<()>;

    /// Whether a queued or running job exists for the event
    async fn has_pending_job(&self, event_id: Uuid) -> BillingResult<bool>;

    /// Delete finished and buried jobs last touched before `older_than`
    async fn purge_finished(&self, older_than: OffsetDateTime) -> BillingResult<u64>;
}
