//! Durable job queue backed by the SQLite database.
//!
//! Provides the three logical queues the engine runs on
//! (`schedule-processing`, `post-comment`, `simulate-view`) with:
//!
//! - delayed jobs (`run_at` in the future),
//! - idempotent enqueue on caller-chosen job ids (`INSERT OR IGNORE`),
//! - lease-based claims with stalled-job reclaim,
//! - retry with exponential backoff and a dead-letter state.
//!
//! Delivery is at-least-once; handlers guard their effects with the
//! cache locks and comment-status transitions.

pub mod worker;

pub use worker::{JobError, JobHandler, JobWorker, WorkerOptions};

use crate::error::QueueError;
use crate::storage::{format_ts, now_ts, DbPool};
use std::time::Duration;

/// Queue fed by the schedule driver; one job per batch.
pub const SCHEDULE_QUEUE: &str = "schedule-processing";

/// Queue of single comment-post attempts.
pub const POST_COMMENT_QUEUE: &str = "post-comment";

/// Queue of simulated-view invocations.
pub const SIMULATE_VIEW_QUEUE: &str = "simulate-view";

/// Base retry backoff for transient failures.
const RETRY_BASE: Duration = Duration::from_secs(3);

/// Delivery state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at`.
    Pending,
    /// Claimed by a worker holding a live lease.
    Running,
    /// Attempts exhausted or terminally failed.
    Dead,
}

/// A persisted job.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct JobRecord {
    /// Caller-chosen unique id (dedup key).
    pub id: String,
    /// Logical queue name.
    pub queue: String,
    /// JSON payload.
    pub payload: String,
    /// Delivery state.
    pub status: JobStatus,
    /// Earliest delivery time.
    pub run_at: String,
    /// Handler attempts consumed.
    pub attempts: i64,
    /// Attempts allowed before dead-letter.
    pub max_attempts: i64,
    /// Lease deadline while running.
    pub lease_expires_at: Option<String>,
    /// Most recent failure detail.
    pub last_error: Option<String>,
    /// ISO-8601 UTC creation timestamp.
    pub created_at: String,
    /// ISO-8601 UTC last-change timestamp.
    pub updated_at: String,
}

impl JobRecord {
    /// Decode the JSON payload.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_str(&self.payload).map_err(|source| QueueError::Payload { source })
    }
}

/// Enqueue options.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Delay before the job becomes due.
    pub delay: Duration,
    /// Handler attempts allowed before dead-letter.
    pub max_attempts: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            max_attempts: 3,
        }
    }
}

impl EnqueueOptions {
    /// Options with a delay and default attempts.
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

/// Handle to the durable queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    pool: DbPool,
}

impl JobQueue {
    /// Wrap the shared database pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Enqueue a job. Returns `false` when a job with this id already
    /// exists (idempotent dedup).
    pub async fn enqueue<T: serde::Serialize>(
        &self,
        queue: &str,
        job_id: &str,
        payload: &T,
        options: EnqueueOptions,
    ) -> Result<bool, QueueError> {
        let payload =
            serde_json::to_string(payload).map_err(|source| QueueError::Payload { source })?;
        let run_at = format_ts(
            chrono::Utc::now()
                + chrono::Duration::from_std(options.delay).unwrap_or_else(|_| chrono::Duration::zero()),
        );

        let result = sqlx::query(
            "INSERT OR IGNORE INTO jobs (id, queue, payload, run_at, max_attempts) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(queue)
        .bind(&payload)
        .bind(&run_at)
        .bind(i64::from(options.max_attempts))
        .execute(&self.pool)
        .await
        .map_err(|source| QueueError::Storage { source })?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            tracing::debug!(queue, job_id, run_at = %run_at, "Job enqueued");
        } else {
            tracing::debug!(queue, job_id, "Job already enqueued, skipping");
        }
        Ok(inserted)
    }

    /// Claim the oldest due job on a queue, taking a lease.
    ///
    /// Due means `pending` with `run_at` reached, or `running` with an
    /// expired lease (stalled worker reclaim; no attempt is consumed).
    pub async fn claim_due(
        &self,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, QueueError> {
        let now = now_ts();
        let lease_deadline = format_ts(
            chrono::Utc::now()
                + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero()),
        );

        sqlx::query_as::<_, JobRecord>(
            "UPDATE jobs SET status = 'running', lease_expires_at = ?, updated_at = ? \
             WHERE id = ( \
               SELECT id FROM jobs WHERE queue = ? AND ( \
                 (status = 'pending' AND run_at <= ?) OR \
                 (status = 'running' AND lease_expires_at <= ?) \
               ) ORDER BY run_at LIMIT 1 \
             ) RETURNING *",
        )
        .bind(&lease_deadline)
        .bind(&now)
        .bind(queue)
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|source| QueueError::Storage { source })
    }

    /// Extend the lease of a running job.
    pub async fn renew_lease(&self, job_id: &str, lease: Duration) -> Result<(), QueueError> {
        let lease_deadline = format_ts(
            chrono::Utc::now()
                + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        sqlx::query(
            "UPDATE jobs SET lease_expires_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(&lease_deadline)
        .bind(now_ts())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|source| QueueError::Storage { source })?;
        Ok(())
    }

    /// Remove a completed job.
    pub async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|source| QueueError::Storage { source })?;
        Ok(())
    }

    /// Record a handler failure.
    ///
    /// Transient failures consume an attempt and re-queue with
    /// `3s · 2^(attempt-1)` backoff until `max_attempts`, then dead-letter.
    /// Terminal failures dead-letter immediately.
    pub async fn fail(
        &self,
        job_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<(), QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| QueueError::Storage { source })?;

        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT attempts, max_attempts FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|source| QueueError::Storage { source })?;

        let Some((attempts, max_attempts)) = row else {
            // Job was removed concurrently; nothing to record.
            return Ok(());
        };

        let new_attempts = attempts + 1;
        if !retryable || new_attempts >= max_attempts {
            sqlx::query(
                "UPDATE jobs SET status = 'dead', attempts = ?, last_error = ?, \
                 lease_expires_at = NULL, updated_at = ? WHERE id = ?",
            )
            .bind(new_attempts)
            .bind(error)
            .bind(now_ts())
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(|source| QueueError::Storage { source })?;
            tracing::warn!(job_id, attempts = new_attempts, error, "Job dead-lettered");
        } else {
            let exponent = u32::try_from(new_attempts - 1).unwrap_or(0);
            let backoff = RETRY_BASE * 2u32.saturating_pow(exponent);
            let run_at = format_ts(
                chrono::Utc::now()
                    + chrono::Duration::from_std(backoff)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
            );
            sqlx::query(
                "UPDATE jobs SET status = 'pending', attempts = ?, last_error = ?, \
                 lease_expires_at = NULL, run_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(new_attempts)
            .bind(error)
            .bind(&run_at)
            .bind(now_ts())
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(|source| QueueError::Storage { source })?;
            tracing::debug!(
                job_id,
                attempts = new_attempts,
                retry_at = %run_at,
                "Job re-queued with backoff"
            );
        }

        tx.commit()
            .await
            .map_err(|source| QueueError::Storage { source })?;
        Ok(())
    }

    /// Remove a job regardless of state.
    pub async fn remove(&self, job_id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|source| QueueError::Storage { source })?;
        Ok(())
    }

    /// Remove every non-running job whose id starts with `prefix`.
    ///
    /// Used to drop the outstanding delayed jobs of a deleted or
    /// deactivated schedule.
    pub async fn remove_by_prefix(&self, prefix: &str) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE id LIKE ? || '%' AND status != 'running'",
        )
        .bind(prefix)
        .execute(&self.pool)
        .await
        .map_err(|source| QueueError::Storage { source })?;
        Ok(result.rows_affected())
    }

    /// Remove dead jobs (maintenance sweep).
    pub async fn purge_dead(&self) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM jobs WHERE status = 'dead'")
            .execute(&self.pool)
            .await
            .map_err(|source| QueueError::Storage { source })?;
        Ok(result.rows_affected())
    }

    /// Whether any live (pending or running) job id starts with `prefix`.
    pub async fn has_live_with_prefix(&self, prefix: &str) -> Result<bool, QueueError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE id LIKE ? || '%' AND status != 'dead')",
        )
        .bind(prefix)
        .fetch_one(&self.pool)
        .await
        .map_err(|source| QueueError::Storage { source })?;
        Ok(row.0 == 1)
    }

    /// Fetch a job by id (tests and status display).
    pub async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, QueueError> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| QueueError::Storage { source })
    }

    /// All live job ids on a queue (tests and maintenance).
    pub async fn live_job_ids(&self, queue: &str) -> Result<Vec<String>, QueueError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM jobs WHERE queue = ? AND status != 'dead' ORDER BY run_at",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(|source| QueueError::Storage { source })?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}
