//! Durable job queue with at-least-once delivery.
//!
//! Jobs live in SQLite. `claim` atomically takes the oldest eligible row and
//! marks it in-flight with a visibility deadline; a worker that crashes or
//! hangs past the deadline makes the job reclaimable by another worker
//! (reclaim counts as an attempt, so a crash-looping job still reaches the
//! dead letter ceiling). Duplicate external side effects under redelivery are
//! prevented by the per-fingerprint exclusivity guard in the worker pool, not
//! by the queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::database::retry::with_store_retry;
use crate::database::DbPool;
use crate::{Error, Result};

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// Retry ceiling: a job whose incremented attempt count exceeds this is
    /// dead-lettered instead of requeued.
    pub max_attempts: i64,
    /// Visibility timeout for in-flight claims, in seconds.
    pub visibility_timeout_secs: u64,
    /// Worker poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            visibility_timeout_secs: 1800,
            poll_interval_ms: 100,
        }
    }
}

/// A fetch request in the queue.
///
/// Immutable once enqueued except `attempt_count`.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Unique job ID.
    pub id: String,
    /// Fingerprint of the normalized source URL.
    pub fingerprint: String,
    /// Original request locator.
    pub source_url: String,
    /// Requester to relay the result to.
    pub requester_id: i64,
    /// Admission time (never changes on requeue).
    pub enqueued_at: DateTime<Utc>,
    /// Number of processing attempts so far.
    pub attempt_count: i64,
}

impl Job {
    /// Create a new pending job.
    pub fn new(
        fingerprint: impl Into<String>,
        source_url: impl Into<String>,
        requester_id: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            fingerprint: fingerprint.into(),
            source_url: source_url.into(),
            requester_id,
            enqueued_at: Utc::now(),
            attempt_count: 0,
        }
    }
}

/// Outcome of a requeue request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Returned to the tail for another attempt.
    Requeued { attempt: i64 },
    /// Exhausted the retry ceiling and moved to the dead letter table.
    DeadLettered,
}

/// Durable storage contract for the queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<()>;
    /// Atomically claim the oldest eligible job: pending, or in-flight with
    /// an expired visibility deadline (reclaim increments `attempt_count`).
    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Job>>;
    /// Permanently remove a job. Returns the number of rows removed (0 when
    /// already acked, making the call idempotent).
    async fn remove(&self, job_id: &str) -> Result<u64>;
    /// Put a job back at the tail with the given attempt count.
    async fn release_to_tail(&self, job: &Job, attempt_count: i64) -> Result<()>;
    /// Move a job to the dead letter table.
    async fn move_to_dead_letter(&self, job: &Job, reason: &str) -> Result<()>;
    /// Number of jobs waiting or in flight.
    async fn depth(&self) -> Result<i64>;
    async fn dead_letter_count(&self) -> Result<i64>;
}

/// Fixed-width UTC timestamp so TEXT comparisons in SQL order correctly.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    fingerprint: String,
    source_url: String,
    requester_id: i64,
    attempt_count: i64,
    enqueued_at: String,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let enqueued_at = DateTime::parse_from_rfc3339(&self.enqueued_at)
            .map_err(|e| Error::Other(format!("corrupt enqueued_at for job {}: {e}", self.id)))?
            .with_timezone(&Utc);
        Ok(Job {
            id: self.id,
            fingerprint: self.fingerprint,
            source_url: self.source_url,
            requester_id: self.requester_id,
            enqueued_at,
            attempt_count: self.attempt_count,
        })
    }
}

/// SQLx implementation of [`JobStore`].
pub struct SqlxJobStore {
    pool: DbPool,
}

impl SqlxJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for SqlxJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let now = ts(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO job
                (id, fingerprint, source_url, requester_id, status, attempt_count,
                 enqueued_at, queued_at, updated_at)
            VALUES (?, ?, ?, ?, 'PENDING', ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.fingerprint)
        .bind(&job.source_url)
        .bind(job.requester_id)
        .bind(job.attempt_count)
        .bind(ts(job.enqueued_at))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        // Single statement so two workers can never claim the same row.
        // Reclaiming an expired in-flight row counts as an attempt.
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE job SET
                status = 'INFLIGHT',
                attempt_count = attempt_count
                    + (CASE WHEN status = 'INFLIGHT' THEN 1 ELSE 0 END),
                claimed_by = ?,
                claim_expires_at = ?,
                updated_at = ?
            WHERE id = (
                SELECT id FROM job
                WHERE status = 'PENDING'
                   OR (status = 'INFLIGHT' AND claim_expires_at < ?)
                ORDER BY queued_at
                LIMIT 1
            )
            RETURNING id, fingerprint, source_url, requester_id, attempt_count, enqueued_at
            "#,
        )
        .bind(worker_id)
        .bind(ts(expires_at))
        .bind(ts(now))
        .bind(ts(now))
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn remove(&self, job_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM job WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn release_to_tail(&self, job: &Job, attempt_count: i64) -> Result<()> {
        let now = ts(Utc::now());
        sqlx::query(
            r#"
            UPDATE job SET
                status = 'PENDING',
                attempt_count = ?,
                queued_at = ?,
                claimed_by = NULL,
                claim_expires_at = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(attempt_count)
        .bind(&now)
        .bind(&now)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn move_to_dead_letter(&self, job: &Job, reason: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO dead_letter
                (id, fingerprint, source_url, requester_id, attempt_count,
                 reason, enqueued_at, failed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.fingerprint)
        .bind(&job.source_url)
        .bind(job.requester_id)
        .bind(job.attempt_count)
        .bind(reason)
        .bind(ts(job.enqueued_at))
        .bind(ts(Utc::now()))
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM job WHERE id = ?")
            .bind(&job.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn depth(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn dead_letter_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letter")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// The durable FIFO facade used by intake and the worker pool.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: JobQueueConfig,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: JobQueueConfig) -> Self {
        Self {
            store,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    /// Wakeup handle for workers waiting on new jobs.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Append a job durably. Returns as soon as the row is committed.
    pub async fn enqueue(&self, job: &Job) -> Result<()> {
        with_store_retry("job enqueue", || self.store.insert(job)).await?;
        debug!(job_id = %job.id, fingerprint = %job.fingerprint, "Job enqueued");
        self.notify.notify_one();
        Ok(())
    }

    /// Claim the oldest eligible job for `worker_id`, or `None` when empty.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(self.config.visibility_timeout_secs as i64);
        let claimed =
            with_store_retry("job claim", || self.store.claim_next(worker_id, now, expires_at))
                .await?;
        if let Some(job) = &claimed {
            debug!(job_id = %job.id, worker_id, attempt = job.attempt_count, "Job claimed");
        }
        Ok(claimed)
    }

    /// Permanently remove a job. Idempotent: acking twice is a no-op.
    pub async fn ack(&self, job_id: &str) -> Result<()> {
        let removed = with_store_retry("job ack", || self.store.remove(job_id)).await?;
        if removed == 0 {
            debug!(job_id, "Ack for already-removed job (no-op)");
        }
        Ok(())
    }

    /// Return a job to the tail with `attempt_count + 1`, or dead-letter it
    /// once the ceiling is exceeded.
    pub async fn requeue(&self, job: &Job, reason: &str) -> Result<RequeueOutcome> {
        let next_attempt = job.attempt_count + 1;
        if next_attempt > self.config.max_attempts {
            self.dead_letter(job, reason).await?;
            return Ok(RequeueOutcome::DeadLettered);
        }

        with_store_retry("job requeue", || self.store.release_to_tail(job, next_attempt)).await?;
        info!(
            job_id = %job.id,
            attempt = next_attempt,
            max_attempts = self.config.max_attempts,
            reason,
            "Job requeued"
        );
        self.notify.notify_one();
        Ok(RequeueOutcome::Requeued { attempt: next_attempt })
    }

    /// Move a job straight to the dead letter table.
    pub async fn dead_letter(&self, job: &Job, reason: &str) -> Result<()> {
        with_store_retry("job dead-letter", || self.store.move_to_dead_letter(job, reason))
            .await?;
        warn!(
            job_id = %job.id,
            fingerprint = %job.fingerprint,
            attempts = job.attempt_count,
            reason,
            "Job dead-lettered"
        );
        Ok(())
    }

    /// Number of jobs waiting or in flight.
    pub async fn depth(&self) -> Result<i64> {
        with_store_retry("queue depth", || self.store.depth()).await
    }
}
