//! SQLite-backed job queue.
//!
//! Deduplication relies on the `UNIQUE` idempotency key: a second start with
//! the same key hits `INSERT OR IGNORE` and reports [`Enqueued::Duplicate`].
//! Finished rows are kept, so a late duplicate of a completed step is still
//! rejected. Claiming a job is a single `UPDATE .. RETURNING` statement, which
//! SQLite executes atomically, so concurrent workers never share a job.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{Enqueued, Job, JobError, JobPayload, JobStarter, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub(crate) enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("payload serialization error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("invalid correlation id stored for job {job_id}: {source}")]
    CorrelationId {
        job_id: i64,
        #[source]
        source: uuid::Error,
    },
    #[error("unknown job status {0:?}")]
    UnknownStatus(String),
    #[error("job {0} not found")]
    NotFound(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub(crate) const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(status: &str) -> Result<Self, Self::Err> {
        match status {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::UnknownStatus(other.to_string())),
        }
    }
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureDisposition {
    Retrying { delay: Duration },
    Terminal,
}

/// Stored view of a job, for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JobRecord {
    pub(crate) id: i64,
    pub(crate) payload: JobPayload,
    pub(crate) step: String,
    pub(crate) status: JobStatus,
    pub(crate) attempts_made: u32,
    pub(crate) max_attempts: u32,
    pub(crate) available_at: DateTime<Utc>,
    pub(crate) last_error: Option<String>,
}

#[async_trait]
pub(crate) trait JobQueue: JobStarter {
    /// Claims the oldest job whose delay has elapsed.
    async fn dequeue(&self) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, job_id: i64) -> Result<(), QueueError>;

    /// Records a failed attempt and schedules the retry, or marks the job
    /// terminal when the error is unrecoverable or attempts are exhausted.
    async fn fail(&self, job: &Job, error: &JobError) -> Result<FailureDisposition, QueueError>;

    /// Persists an in-flight reference (e.g. a submitted tx hash) so a retry
    /// resumes from it instead of repeating the side effect.
    async fn update_payload(&self, job_id: i64, payload: &JobPayload) -> Result<(), QueueError>;

    async fn jobs_for_correlation(
        &self,
        correlation_id: Uuid,
    ) -> Result<Vec<JobRecord>, QueueError>;
}

pub(crate) struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    pub(crate) const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Requeues jobs left `active` by a process that died mid-step.
    pub(crate) async fn recover_stalled(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', updated_at = CURRENT_TIMESTAMP \
             WHERE status = 'active'",
        )
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(recovered, "Requeued jobs left active by a previous run");
        }

        Ok(recovered)
    }

    /// Makes every delayed job available immediately.
    #[cfg(test)]
    pub(crate) async fn release_delayed(&self) {
        sqlx::query("UPDATE jobs SET available_at = 0 WHERE status = 'queued'")
            .execute(&self.pool)
            .await
            .unwrap();
    }

    async fn mark_undecodable(&self, job_id: i64, error: &QueueError) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE jobs SET status = 'failed', last_error = ?, updated_at = CURRENT_TIMESTAMP \
             WHERE id = ?",
        )
        .bind(error.to_string())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn count(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: i64,
    correlation_id: String,
    payload: String,
    attempts_made: i64,
    max_attempts: i64,
}

impl ClaimedRow {
    fn decode(self) -> Result<Job, QueueError> {
        let correlation_id =
            Uuid::parse_str(&self.correlation_id).map_err(|source| QueueError::CorrelationId {
                job_id: self.id,
                source,
            })?;

        Ok(Job {
            id: self.id,
            payload: serde_json::from_str(&self.payload)?,
            correlation_id,
            attempts_made: count(self.attempts_made),
            max_attempts: count(self.max_attempts),
        })
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: i64,
    payload: String,
    step: String,
    status: String,
    attempts_made: i64,
    max_attempts: i64,
    available_at: i64,
    last_error: Option<String>,
}

impl TryFrom<RecordRow> for JobRecord {
    type Error = QueueError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            payload: serde_json::from_str(&row.payload)?,
            step: row.step,
            status: row.status.parse()?,
            attempts_made: count(row.attempts_made),
            max_attempts: count(row.max_attempts),
            available_at: DateTime::from_timestamp_millis(row.available_at).unwrap_or_default(),
            last_error: row.last_error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    attempts_made: i64,
    max_attempts: i64,
    backoff_base_ms: i64,
    backoff_multiplier: i64,
}

#[async_trait]
impl JobStarter for SqliteJobQueue {
    #[tracing::instrument(skip_all, fields(kind = %payload.kind(), correlation_id = %payload.correlation_id()), level = tracing::Level::DEBUG)]
    async fn start(&self, payload: JobPayload, delay: Duration) -> Result<Enqueued, QueueError> {
        let key = payload.idempotency_key();
        let policy = payload.retry_policy();
        let step = payload.step();
        let available_at = now_millis().saturating_add(millis(delay));

        let result = sqlx::query(
            "INSERT OR IGNORE INTO jobs \
             (idempotency_key, kind, correlation_id, step, payload, available_at, \
              max_attempts, backoff_base_ms, backoff_multiplier) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(key.to_string())
        .bind(payload.kind().as_str())
        .bind(payload.correlation_id().to_string())
        .bind(&step)
        .bind(serde_json::to_string(&payload)?)
        .bind(available_at)
        .bind(i64::from(policy.max_attempts))
        .bind(millis(policy.base_delay))
        .bind(i64::from(policy.multiplier))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(%key, step, "Duplicate start ignored");
            return Ok(Enqueued::Duplicate);
        }

        let job_id = result.last_insert_rowid();
        debug!(job_id, %key, step, delay_ms = millis(delay), "Job enqueued");

        Ok(Enqueued::Queued(job_id))
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        let claimed: Option<ClaimedRow> = sqlx::query_as(
            "UPDATE jobs SET status = 'active', updated_at = CURRENT_TIMESTAMP \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE status = 'queued' AND available_at <= ? \
                 ORDER BY available_at, id \
                 LIMIT 1 \
             ) \
             RETURNING id, correlation_id, payload, attempts_made, max_attempts",
        )
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        let Some(claimed) = claimed else {
            return Ok(None);
        };

        let job_id = claimed.id;
        match claimed.decode() {
            Ok(job) => Ok(Some(job)),
            Err(error) => {
                warn!(job_id, %error, "Claimed job is undecodable, failing it");
                self.mark_undecodable(job_id, &error).await?;
                Err(error)
            }
        }
    }

    async fn complete(&self, job_id: i64) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }

        Ok(())
    }

    async fn fail(&self, job: &Job, error: &JobError) -> Result<FailureDisposition, QueueError> {
        let row: Option<AttemptRow> = sqlx::query_as(
            "SELECT attempts_made, max_attempts, backoff_base_ms, backoff_multiplier \
             FROM jobs WHERE id = ?",
        )
        .bind(job.id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(QueueError::NotFound(job.id))?;
        let attempts_made = row.attempts_made.saturating_add(1);

        let policy = RetryPolicy {
            max_attempts: count(row.max_attempts),
            base_delay: Duration::from_millis(u64::try_from(row.backoff_base_ms).unwrap_or(0)),
            multiplier: count(row.backoff_multiplier),
        };

        let exhausted = count(attempts_made) >= policy.max_attempts;

        if error.is_retryable() && !exhausted {
            let delay = policy.delay_after(count(attempts_made));

            sqlx::query(
                "UPDATE jobs SET status = 'queued', attempts_made = ?, available_at = ?, \
                 last_error = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            )
            .bind(attempts_made)
            .bind(now_millis().saturating_add(millis(delay)))
            .bind(error.to_string())
            .bind(job.id)
            .execute(&self.pool)
            .await?;

            return Ok(FailureDisposition::Retrying { delay });
        }

        sqlx::query(
            "UPDATE jobs SET status = 'failed', attempts_made = ?, last_error = ?, \
             updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(attempts_made)
        .bind(error.to_string())
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        Ok(FailureDisposition::Terminal)
    }

    async fn update_payload(&self, job_id: i64, payload: &JobPayload) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET payload = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(serde_json::to_string(payload)?)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }

        Ok(())
    }

    async fn jobs_for_correlation(
        &self,
        correlation_id: Uuid,
    ) -> Result<Vec<JobRecord>, QueueError> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            "SELECT id, payload, step, status, attempts_made, max_attempts, available_at, \
             last_error FROM jobs WHERE correlation_id = ? ORDER BY id",
        )
        .bind(correlation_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }
}
