//! In-process job queue with the same lease and retry semantics as
//! [`super::PgJobQueue`]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobOptions, JobQueue, ReservedJob, WebhookJob};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Queued,
    Running,
    Done,
    Dead,
}

#[derive(Debug, Clone)]
struct Entry {
    job: WebhookJob,
    status: JobStatus,
    attempts_made: u32,
    max_attempts: u32,
    backoff_delay: Duration,
    run_at: Instant,
    locked_until: Option<Instant>,
    last_error: Option<String>,
    seq: u64,
    updated_at: OffsetDateTime,
}

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Entry>,
    next_seq: u64,
}

#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<State>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queued or running jobs
    pub async fn pending_count(&self) -> usize {
        self.state
            .lock()
            .await
            .jobs
            .values()
            .filter(|e| matches!(e.status, JobStatus::Queued | JobStatus::Running))
            .count()
    }

    /// Last error of every buried job, keyed by event id
    pub async fn dead_letters(&self) -> Vec<(Uuid, Option<String>)> {
        self.state
            .lock()
            .await
            .jobs
            .values()
            .filter(|e| e.status == JobStatus::Dead)
            .map(|e| (e.job.event_id, e.last_error.clone()))
            .collect()
    }

    /// Jobs ever enqueued for an event, in any status
    pub async fn jobs_for_event(&self, event_id: Uuid) -> usize {
        self.state
            .lock()
            .await
            .jobs
            .values()
            .filter(|e| e.job.event_id == event_id)
            .count()
    }

    async fn update(&self, job_id: Uuid, f: impl FnOnce(&mut Entry) + Send) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| BillingError::Queue(format!("job {job_id} not found")))?;
        f(entry);
        entry.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: WebhookJob, options: JobOptions) -> BillingResult<Uuid> {
        let mut state = self.state.lock().await;
        let id = Uuid::new_v4();
        let seq = state.next_seq;
        state.next_seq += 1;

        state.jobs.insert(
            id,
            Entry {
                job,
                status: JobStatus::Queued,
                attempts_made: 0,
                max_attempts: options.attempts.max(1),
                backoff_delay: options.backoff_delay,
                run_at: Instant::now(),
                locked_until: None,
                last_error: None,
                seq,
                updated_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(id)
    }

    async fn reserve(&self, lease: Duration) -> BillingResult<Option<ReservedJob>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let next = state
            .jobs
            .iter()
            .filter(|(_, e)| match e.status {
                JobStatus::Queued => e.run_at <= now,
                JobStatus::Running => e.locked_until.is_some_and(|until| until < now),
                JobStatus::Done | JobStatus::Dead => false,
            })
            .min_by_key(|(_, e)| (e.run_at, e.seq))
            .map(|(id, _)| *id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };

        entry.status = JobStatus::Running;
        entry.attempts_made += 1;
        entry.locked_until = Some(now + lease);
        entry.updated_at = OffsetDateTime::now_utc();

        Ok(Some(ReservedJob {
            id,
            job: entry.job.clone(),
            attempts_made: entry.attempts_made,
            max_attempts: entry.max_attempts,
            backoff_delay: entry.backoff_delay,
        }))
    }

    async fn ack(&self, job_id: Uuid) -> BillingResult<()> {
        self.update(job_id, |e| {
            e.status = JobStatus::Done;
            e.locked_until = None;
        })
        .await
    }

    async fn retry(&self, job_id: Uuid, delay: Duration, error: &str) -> BillingResult<()> {
        let error = error.to_string();
        self.update(job_id, move |e| {
            e.status = JobStatus::Queued;
            e.run_at = Instant::now() + delay;
            e.locked_until = None;
            e.last_error = Some(error);
        })
        .await
    }

    async fn bury(&self, job_id: Uuid, error: &str) -> BillingResult<()> {
        let error = error.to_string();
        self.update(job_id, move |e| {
            e.status = JobStatus::Dead;
            e.locked_until = None;
            e.last_error = Some(error);
        })
        .await
    }

    async fn has_pending_job(&self, event_id: Uuid) -> BillingResult<bool> {
        Ok(self.state.lock().await.jobs.values().any(|e| {
            e.job.event_id == event_id && matches!(e.status, JobStatus::Queued | JobStatus::Running)
        }))
    }

    async fn purge_finished(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, e| {
            !(matches!(e.status, JobStatus::Done | JobStatus::Dead) && e.updated_at < older_than)
        });
        Ok((before - state.jobs.len()) as u64)
    }
}
