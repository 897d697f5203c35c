//! Worker-side job processing
//!
//! Every failure is written to the event row immediately, so the audit log
//! always shows the latest error. Retryable failures go back on the queue
//! with backoff until the attempt ceiling; permanent ones are buried at once.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::WebhookStatus;
use crate::queue::{JobOptions, JobQueue, ReservedJob, WebhookJob};
use crate::reconciler::Reconciler;
use crate::store::BillingStore;

/// Stale events inspected per sweep
const STUCK_SWEEP_BATCH: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// The event was already completed by an earlier delivery
    AlreadyCompleted,
    Retrying { attempt: u32, delay: Duration },
    /// Buried; the event row is left `failed`
    Failed { permanent: bool },
}

#[derive(Clone)]
pub struct JobProcessor {
    store: Arc<dyn BillingStore>,
    queue: Arc<dyn JobQueue>,
    reconciler: Reconciler,
}

impl JobProcessor {
    pub fn new(store: Arc<dyn BillingStore>, queue: Arc<dyn JobQueue>, reconciler: Reconciler) -> Self {
        Self {
            store,
            queue,
            reconciler,
        }
    }

    /// Reserve and process one job. `None` when the queue is idle.
    pub async fn run_once(&self, lease: Duration) -> BillingResult<Option<ProcessOutcome>> {
        let Some(reserved) = self.queue.reserve(lease).await? else {
            return Ok(None);
        };
        self.process(reserved).await.map(Some)
    }

    pub async fn process(&self, reserved: ReservedJob) -> BillingResult<ProcessOutcome> {
        let job = &reserved.job;

        let Some(event) = self.store.get_webhook_event(job.event_id).await? else {
            let error = BillingError::WebhookEventNotFound(job.event_id.to_string());
            tracing::error!(event_id = %job.event_id, "Job references a missing webhook event");
            self.queue.bury(reserved.id, &error.to_string()).await?;
            return Ok(ProcessOutcome::Failed { permanent: true });
        };

        if event.status == WebhookStatus::Completed {
            tracing::debug!(event_id = %event.id, "Event already completed, acknowledging");
            self.queue.ack(reserved.id).await?;
            return Ok(ProcessOutcome::AlreadyCompleted);
        }

        match self.reconciler.apply(&job.event_type, &job.payload).await {
            Ok(()) => {
                self.store.mark_webhook_completed(event.id).await?;
                self.queue.ack(reserved.id).await?;
                tracing::info!(
                    event_id = %event.id,
                    event_type = %job.event_type,
                    attempt = reserved.attempts_made,
                    "Webhook event processed"
                );
                Ok(ProcessOutcome::Completed)
            }
            Err(e) => self.handle_failure(&reserved, e).await,
        }
    }

    async fn handle_failure(
        &self,
        reserved: &ReservedJob,
        error: BillingError,
    ) -> BillingResult<ProcessOutcome> {
        let job = &reserved.job;
        let message = error.to_string();

        if let Err(e) = self.store.mark_webhook_failed(job.event_id, &message).await {
            tracing::error!(event_id = %job.event_id, error = %e, "Failed to record webhook failure");
        }

        if !error.is_retryable() {
            tracing::error!(
                event_id = %job.event_id,
                event_type = %job.event_type,
                attempt = reserved.attempts_made,
                error = %message,
                "Webhook event failed permanently"
            );
            self.queue.bury(reserved.id, &message).await?;
            return Ok(ProcessOutcome::Failed { permanent: true });
        }

        if reserved.is_last_attempt() {
            tracing::error!(
                event_id = %job.event_id,
                event_type = %job.event_type,
                attempt = reserved.attempts_made,
                error = %message,
                "Webhook event exhausted retries"
            );
            self.queue.bury(reserved.id, &message).await?;
            return Ok(ProcessOutcome::Failed { permanent: false });
        }

        let delay = reserved.next_delay();
        tracing::warn!(
            event_id = %job.event_id,
            event_type = %job.event_type,
            attempt = reserved.attempts_made,
            max_attempts = reserved.max_attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %message,
            "Webhook event failed, will retry"
        );
        self.queue.retry(reserved.id, delay, &message).await?;
        Ok(ProcessOutcome::Retrying {
            attempt: reserved.attempts_made,
            delay,
        })
    }

    /// Re-enqueue events stuck in `received` with no job behind them.
    ///
    /// Happens when ingestion stored the row but the enqueue failed.
    pub async fn requeue_stuck_events(
        &self,
        older_than: Duration,
        options: JobOptions,
    ) -> BillingResult<usize> {
        let cutoff = OffsetDateTime::now_utc() - older_than;
        let stale = self
            .store
            .list_stale_received_events(cutoff, STUCK_SWEEP_BATCH)
            .await?;

        let mut requeued = 0;
        for event in stale {
            if self.queue.has_pending_job(event.id).await? {
                continue;
            }

            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                created_at = %event.created_at,
                "Webhook event stuck in received, re-enqueueing"
            );
            self.queue
                .enqueue(
                    WebhookJob {
                        event_id: event.id,
                        event_type: event.event_type,
                        payload: event.payload,
                    },
                    options,
                )
                .await?;
            requeued += 1;
        }

        Ok(requeued)
    }

    /// Drop finished job rows; the event audit log is untouched
    pub async fn purge_finished_jobs(&self, older_than: Duration) -> BillingResult<u64> {
        self.queue
            .purge_finished(OffsetDateTime::now_utc() - older_than)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::testing::RecordingEmailSender;
    use crate::models::NewWebhookEvent;
    use crate::queue::InMemoryJobQueue;
    use crate::store::InMemoryBillingStore;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(60);

    fn options() -> JobOptions {
        JobOptions {
            attempts: 3,
            backoff_delay: Duration::ZERO,
        }
    }

    fn setup() -> (JobProcessor, Arc<InMemoryBillingStore>, Arc<InMemoryJobQueue>) {
        let store = Arc::new(InMemoryBillingStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let reconciler = Reconciler::new(store.clone(), Arc::new(RecordingEmailSender::default()));
        (
            JobProcessor::new(store.clone(), queue.clone(), reconciler),
            store,
            queue,
        )
    }

    async fn accept(
        store: &InMemoryBillingStore,
        queue: &InMemoryJobQueue,
        id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> uuid::Uuid {
        let event = store
            .create_webhook_event(NewWebhookEvent {
                provider_event_id: id.to_string(),
                event_type: event_type.to_string(),
                payload: payload.clone(),
            })
            .await
            .unwrap();
        queue
            .enqueue(
                WebhookJob {
                    event_id: event.id,
                    event_type: event_type.to_string(),
                    payload,
                },
                options(),
            )
            .await
            .unwrap();
        event.id
    }

    #[tokio::test]
    async fn test_idle_queue() {
        let (processor, _, _) = setup();
        assert_eq!(processor.run_once(LEASE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_event_completes_without_handler() {
        let (processor, store, queue) = setup();
        let id = accept(&store, &queue, "evt_1", "something.new", json!({"x": 1})).await;

        let outcome = processor.run_once(LEASE).await.unwrap();

        assert_eq!(outcome, Some(ProcessOutcome::Completed));
        let event = store.get_webhook_event(id).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Completed);
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_buried_without_retry() {
        let (processor, store, queue) = setup();
        let id = accept(
            &store,
            &queue,
            "evt_1",
            "payment.succeeded",
            json!({"payment_id": "pay_1", "amount": 1999}),
        )
        .await;

        let outcome = processor.run_once(LEASE).await.unwrap();

        assert_eq!(outcome, Some(ProcessOutcome::Failed { permanent: true }));
        let event = store.get_webhook_event(id).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Failed);
        assert!(event
            .error_message
            .unwrap()
            .contains("could not resolve owning user"));
        assert_eq!(queue.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_exhausts_attempts() {
        let (processor, store, queue) = setup();
        let id = accept(
            &store,
            &queue,
            "evt_1",
            "subscription.cancelled",
            json!({"subscription_id": "sub_missing"}),
        )
        .await;

        for attempt in 1..=2 {
            let outcome = processor.run_once(LEASE).await.unwrap().unwrap();
            assert_eq!(
                outcome,
                ProcessOutcome::Retrying {
                    attempt,
                    delay: Duration::ZERO
                }
            );
            let event = store.get_webhook_event(id).await.unwrap().unwrap();
            assert_eq!(event.status, WebhookStatus::Failed);
        }

        let outcome = processor.run_once(LEASE).await.unwrap().unwrap();
        assert_eq!(outcome, ProcessOutcome::Failed { permanent: false });
        assert_eq!(processor.run_once(LEASE).await.unwrap(), None);

        let event = store.get_webhook_event(id).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Failed);
        assert!(event.error_message.unwrap().contains("sub_missing"));
    }

    #[tokio::test]
    async fn test_completed_event_is_acknowledged_not_reapplied() {
        let (processor, store, queue) = setup();
        let id = accept(&store, &queue, "evt_1", "something.new", json!({})).await;
        store.mark_webhook_completed(id).await.unwrap();

        let outcome = processor.run_once(LEASE).await.unwrap();
        assert_eq!(outcome, Some(ProcessOutcome::AlreadyCompleted));
    }

    #[tokio::test]
    async fn test_stuck_event_without_job_is_requeued() {
        let (processor, store, queue) = setup();
        let orphan = store
            .create_webhook_event(NewWebhookEvent {
                provider_event_id: "evt_orphan".to_string(),
                event_type: "something.new".to_string(),
                payload: json!({}),
            })
            .await
            .unwrap();
        let queued = accept(&store, &queue, "evt_queued", "something.new", json!({})).await;

        let requeued = processor
            .requeue_stuck_events(Duration::ZERO, options())
            .await
            .unwrap();

        assert_eq!(requeued, 1);
        assert_eq!(queue.jobs_for_event(orphan.id).await, 1);
        assert_eq!(queue.jobs_for_event(queued).await, 1);

        // A second sweep finds a pending job and leaves it alone
        let requeued = processor
            .requeue_stuck_events(Duration::ZERO, options())
            .await
            .unwrap();
        assert_eq!(requeued, 0);
    }
}
