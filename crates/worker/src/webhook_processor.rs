//! Webhook job worker pool
//!
//! A fixed number of tasks share the queue. Each reserves one job at a time
//! and runs it to completion before looking at the shutdown flag again, so a
//! shutdown never abandons a job halfway through its handler.

use std::time::Duration;

use recap_billing::{JobProcessor, ProcessOutcome};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct WorkerPool {
    processor: JobProcessor,
    concurrency: usize,
    poll_interval: Duration,
    lease: Duration,
}

impl WorkerPool {
    pub fn new(
        processor: JobProcessor,
        concurrency: usize,
        poll_interval: Duration,
        lease: Duration,
    ) -> Self {
        Self {
            processor,
            concurrency: concurrency.max(1),
            poll_interval,
            lease,
        }
    }

    /// Start the workers. They exit once `shutdown` flips to `true`.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|worker_id| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.run_worker(worker_id, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id, "Webhook worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.processor.run_once(self.lease).await {
                // Keep draining while there is work
                Ok(Some(outcome)) => {
                    debug!(worker_id, outcome = ?outcome, "Job processed");
                    if !matches!(outcome, ProcessOutcome::Retrying { .. }) {
                        continue;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id, error = %e, "Webhook worker iteration failed");
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(worker_id, "Webhook worker stopped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::Arc;

    use recap_billing::{
        BillingEmailService, BillingStore, EmailConfig, InMemoryBillingStore, InMemoryJobQueue,
        JobOptions, JobQueue, Reconciler, WebhookJob, WebhookStatus,
    };
    use recap_billing::models::NewWebhookEvent;
    use serde_json::json;

    fn pool(
        store: Arc<InMemoryBillingStore>,
        queue: Arc<InMemoryJobQueue>,
        concurrency: usize,
    ) -> WorkerPool {
        let email = Arc::new(BillingEmailService::new(EmailConfig::new(None, None)).unwrap());
        let reconciler = Reconciler::new(store.clone(), email);
        let processor = JobProcessor::new(store, queue, reconciler);
        WorkerPool::new(
            processor,
            concurrency,
            Duration::from_millis(10),
            Duration::from_secs(30),
        )
    }

    async fn accept(
        store: &InMemoryBillingStore,
        queue: &InMemoryJobQueue,
        provider_event_id: &str,
    ) -> uuid::Uuid {
        let event = store
            .create_webhook_event(NewWebhookEvent {
                provider_event_id: provider_event_id.to_string(),
                event_type: "something.new".to_string(),
                payload: json!({}),
            })
            .await
            .unwrap();
        queue
            .enqueue(
                WebhookJob {
                    event_id: event.id,
                    event_type: event.event_type.clone(),
                    payload: event.payload.clone(),
                },
                JobOptions::default(),
            )
            .await
            .unwrap();
        event.id
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops_on_shutdown() {
        let store = Arc::new(InMemoryBillingStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(accept(&store, &queue, &format!("evt_{i}")).await);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = pool(store.clone(), queue.clone(), 3).spawn(shutdown_rx);
        assert_eq!(handles.len(), 3);

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.pending_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue should drain");

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("worker should stop")
                .unwrap();
        }

        for id in ids {
            let event = store.get_webhook_event(id).await.unwrap().unwrap();
            assert_eq!(event.status, WebhookStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_idle_workers_stop_promptly() {
        let store = Arc::new(InMemoryBillingStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let workers = WorkerPool::new(
            pool(store, queue, 2).processor,
            2,
            Duration::from_secs(3600),
            Duration::from_secs(30),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = workers.spawn(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("idle worker should wake on shutdown")
                .unwrap();
        }
    }
}
