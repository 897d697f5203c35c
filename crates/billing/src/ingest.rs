//! Webhook ingestion
//!
//! Runs between the HTTP boundary and the queue:
//!
//! 1. Stage-1 dedup on the delivery id (before any crypto)
//! 2. Signature verification
//! 3. Envelope, then event-payload validation
//! 4. Stage-2 dedup on the canonical event id
//! 5. Persist the event as `received` and enqueue it
//!
//! Nothing here applies business state; that is the worker's job.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{BillingError, BillingResult};
use crate::models::{NewWebhookEvent, WebhookEvent};
use crate::queue::{JobOptions, JobQueue, WebhookJob};
use crate::signature::{SignatureVerifier, WebhookHeaders};
use crate::store::BillingStore;

/// Why a delivery was acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored and enqueued
    Accepted { event_id: Uuid, event_type: String },
    /// Already seen under this delivery id or canonical event id
    Duplicate { provider_event_id: String },
}

#[derive(Clone)]
pub struct WebhookIngestor {
    store: Arc<dyn BillingStore>,
    queue: Arc<dyn JobQueue>,
    verifier: SignatureVerifier,
    job_options: JobOptions,
}

impl WebhookIngestor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        queue: Arc<dyn JobQueue>,
        verifier: SignatureVerifier,
        job_options: JobOptions,
    ) -> Self {
        Self {
            store,
            queue,
            verifier,
            job_options,
        }
    }

    pub async fn ingest(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> BillingResult<IngestOutcome> {
        self.ingest_at(headers, body, OffsetDateTime::now_utc().unix_timestamp())
            .await
    }

    /// Ingest against an explicit clock, in Unix seconds
    pub async fn ingest_at(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
        now: i64,
    ) -> BillingResult<IngestOutcome> {
        if self.store.find_webhook_event(&headers.id).await?.is_some() {
            tracing::debug!(delivery_id = %headers.id, "Duplicate delivery id, skipping");
            return Ok(IngestOutcome::Duplicate {
                provider_event_id: headers.id.clone(),
            });
        }

        let value = self.verifier.verify_at(headers, body, now)?;

        let envelope = Envelope::from_value(value).inspect_err(|e| {
            tracing::warn!(delivery_id = %headers.id, error = %e, "Rejected webhook envelope");
        })?;

        let event = envelope.decode_event().inspect_err(|e| {
            tracing::warn!(
                delivery_id = %headers.id,
                event_type = %envelope.event_type,
                error = %e,
                "Rejected webhook payload"
            );
        })?;

        let canonical_id = envelope.canonical_id(&headers.id).to_string();
        if canonical_id != headers.id
            && self.store.find_webhook_event(&canonical_id).await?.is_some()
        {
            tracing::info!(
                delivery_id = %headers.id,
                provider_event_id = %canonical_id,
                "Event already received under another delivery id, skipping"
            );
            return Ok(IngestOutcome::Duplicate {
                provider_event_id: canonical_id,
            });
        }

        let created = self
            .store
            .create_webhook_event(NewWebhookEvent {
                provider_event_id: canonical_id.clone(),
                event_type: envelope.event_type.clone(),
                payload: envelope.object,
            })
            .await;

        let record = match created {
            Ok(record) => record,
            Err(BillingError::AlreadyExists(_)) => {
                // Lost the insert race to a concurrent delivery of the same event
                tracing::info!(
                    provider_event_id = %canonical_id,
                    "Concurrent duplicate delivery, skipping"
                );
                return Ok(IngestOutcome::Duplicate {
                    provider_event_id: canonical_id,
                });
            }
            Err(e) => return Err(e),
        };

        self.enqueue(&record).await?;

        tracing::info!(
            event_id = %record.id,
            provider_event_id = %record.provider_event_id,
            event_type = %record.event_type,
            known = event.kind().is_some(),
            body_len = body.len(),
            "Webhook accepted"
        );

        Ok(IngestOutcome::Accepted {
            event_id: record.id,
            event_type: record.event_type,
        })
    }

    /// Put a failed or stuck event back on the queue.
    ///
    /// Refused while a job for the event is still queued or running, so one
    /// event never has two jobs in flight.
    pub async fn replay(&self, event_id: Uuid) -> BillingResult<WebhookEvent> {
        if self.queue.has_pending_job(event_id).await? {
            return Err(BillingError::InvalidState(format!(
                "webhook event {event_id} still has a pending job"
            )));
        }

        let record = self.store.reset_webhook_for_replay(event_id).await?;
        self.enqueue(&record).await?;

        tracing::info!(
            event_id = %record.id,
            event_type = %record.event_type,
            "Webhook event replayed"
        );
        Ok(record)
    }

    async fn enqueue(&self, record: &WebhookEvent) -> BillingResult<()> {
        let job = WebhookJob {
            event_id: record.id,
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
        };

        if let Err(e) = self.queue.enqueue(job, self.job_options).await {
            // The row stays `received`; the stuck-event sweep picks it up
            tracing::error!(
                event_id = %record.id,
                event_type = %record.event_type,
                error = %e,
                "Failed to enqueue webhook event"
            );
            return Err(e);
        }
        Ok(())
    }
}
