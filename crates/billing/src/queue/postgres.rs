//! Postgres job queue over `webhook_jobs`
//!
//! Reservation uses `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! claim the same row; `locked_until` is the lease.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{JobOptions, JobQueue, ReservedJob, WebhookJob};
use crate::error::{BillingError, BillingResult};

#[derive(sqlx::FromRow)]
struct ReservedRow {
    id: Uuid,
    event_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    attempts_made: i32,
    max_attempts: i32,
    backoff_ms: i64,
}

impl From<ReservedRow> for ReservedJob {
    fn from(row: ReservedRow) -> Self {
        ReservedJob {
            id: row.id,
            job: WebhookJob {
                event_id: row.event_id,
                event_type: row.event_type,
                payload: row.payload,
            },
            attempts_made: u32::try_from(row.attempts_made).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(1),
            backoff_delay: Duration::from_millis(u64::try_from(row.backoff_ms).unwrap_or(0)),
        }
    }
}

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn finish(&self, job_id: Uuid, status: &str, error: Option<&str>) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_jobs
            SET status = $2, last_error = COALESCE($3, last_error), locked_until = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;

        if result.rows_affected() == 0 {
            return Err(BillingError::Queue(format!("job {job_id} not found")));
        }
        Ok(())
    }
}

fn queue_error(e: sqlx::Error) -> BillingError {
    BillingError::Queue(e.to_string())
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: WebhookJob, options: JobOptions) -> BillingResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO webhook_jobs (id, event_id, event_type, payload, status, max_attempts, backoff_ms)
            VALUES ($1, $2, $3, $4, 'queued', $5, $6)
            "#,
        )
        .bind(id)
        .bind(job.event_id)
        .bind(&job.event_type)
        .bind(&job.payload)
        .bind(i32::try_from(options.attempts).unwrap_or(i32::MAX).max(1))
        .bind(i64::try_from(options.backoff_delay.as_millis()).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;

        Ok(id)
    }

    async fn reserve(&self, lease: Duration) -> BillingResult<Option<ReservedJob>> {
        let row: Option<ReservedRow> = sqlx::query_as(
            r#"
            UPDATE webhook_jobs SET
                status = 'running',
                attempts_made = attempts_made + 1,
                locked_until = NOW() + make_interval(secs => $1),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM webhook_jobs
                WHERE (status = 'queued' AND run_at <= NOW())
                   OR (status = 'running' AND locked_until < NOW())
                ORDER BY run_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event_id, event_type, payload, attempts_made, max_attempts, backoff_ms
            "#,
        )
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_error)?;

        Ok(row.map(ReservedJob::from))
    }

    async fn ack(&self, job_id: Uuid) -> BillingResult<()> {
        self.finish(job_id, "done", None).await
    }

    async fn retry(&self, job_id: Uuid, delay: Duration, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_jobs SET
                status = 'queued',
                run_at = NOW() + make_interval(secs => $2),
                locked_until = NULL,
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(delay.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;
        Ok(())
    }

    async fn bury(&self, job_id: Uuid, error: &str) -> BillingResult<()> {
        self.finish(job_id, "dead", Some(error)).await
    }

    async fn has_pending_job(&self, event_id: Uuid) -> BillingResult<bool> {
        let (pending,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM webhook_jobs
                WHERE event_id = $1 AND status IN ('queued', 'running')
            )
            "#,
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await
        .map_err(queue_error)?;

        Ok(pending)
    }

    async fn purge_finished(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            "DELETE FROM webhook_jobs WHERE status IN ('done', 'dead') AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?;

        Ok(result.rows_affected())
    }
}
