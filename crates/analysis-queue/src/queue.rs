use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rating_core::{AnalysisError, AnalysisJob, Clock, EnqueueOutcome, JobPriority, JobStatus};
use sqlx::SqlitePool;

pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Durable analysis job queue. Enforces at most one non-terminal job per
/// ticker and hands out jobs via an atomic claim, so multiple workers can
/// poll the same queue safely.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

/// Parameters for one enqueue call.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub ticker: String,
    pub source: String,
    pub priority: JobPriority,
    pub force: bool,
    pub max_retries: i64,
}

impl EnqueueRequest {
    pub fn new(ticker: &str, source: &str, priority: JobPriority) -> Self {
        Self {
            ticker: ticker.trim().to_uppercase(),
            source: source.to_string(),
            priority,
            force: false,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Supersede any non-terminal job for the ticker instead of skipping.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Raw row shape; converted to `AnalysisJob` after parsing status and
/// timestamps.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    ticker: String,
    source: String,
    priority: i64,
    status: String,
    retry_count: i64,
    max_retries: i64,
    scheduled_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    current_step: Option<String>,
    step_details: Option<String>,
    error_message: Option<String>,
    created_at: String,
}

const JOB_COLUMNS: &str = "id, ticker, source, priority, status, retry_count, max_retries, \
     scheduled_at, started_at, completed_at, current_step, step_details, error_message, created_at";

impl JobRow {
    fn into_job(self) -> Result<AnalysisJob, AnalysisError> {
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            AnalysisError::InvariantViolation(format!(
                "unknown job status '{}' for job {}",
                self.status, self.id
            ))
        })?;

        Ok(AnalysisJob {
            id: self.id,
            ticker: self.ticker,
            source: self.source,
            priority: JobPriority::from_rank(self.priority),
            status,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            scheduled_at: parse_ts(&self.scheduled_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            current_step: self.current_step,
            step_details: self.step_details,
            error_message: self.error_message,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, AnalysisError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

impl JobQueue {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Initialize the job table and indexes.
    pub async fn init_tables(&self) -> Result<(), AnalysisError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS analysis_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'manual',
                priority INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                scheduled_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                current_step TEXT,
                step_details TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_ticker_status ON analysis_jobs(ticker, status)",
        )
        .execute(&self.pool)
        .await
        .ok();
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_dequeue ON analysis_jobs(status, priority, scheduled_at)",
        )
        .execute(&self.pool)
        .await
        .ok();

        Ok(())
    }

    /// Enqueue an analysis request. Returns `Skipped` if a non-terminal job
    /// already exists for the ticker (single-flight), unless `force` is set,
    /// in which case the existing job is superseded first.
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<EnqueueOutcome, AnalysisError> {
        let now = self.clock.now().to_rfc3339();

        if req.force {
            let superseded = sqlx::query(
                "UPDATE analysis_jobs
                 SET status = 'failed',
                     error_message = 'superseded by forced re-enqueue',
                     completed_at = ?1
                 WHERE ticker = ?2 AND status IN ('pending', 'processing')",
            )
            .bind(&now)
            .bind(&req.ticker)
            .execute(&self.pool)
            .await?;
            if superseded.rows_affected() > 0 {
                tracing::info!(
                    "Superseded {} in-flight job(s) for {} before forced enqueue",
                    superseded.rows_affected(),
                    req.ticker
                );
            }
        }

        // Existence check and insert are one statement, so two concurrent
        // enqueues cannot both pass the check.
        let result = sqlx::query(
            "INSERT INTO analysis_jobs
             (ticker, source, priority, status, retry_count, max_retries, scheduled_at, created_at)
             SELECT ?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5
             WHERE NOT EXISTS (
                 SELECT 1 FROM analysis_jobs
                 WHERE ticker = ?1 AND status IN ('pending', 'processing')
             )",
        )
        .bind(&req.ticker)
        .bind(&req.source)
        .bind(req.priority.rank())
        .bind(req.max_retries)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!("Enqueue skipped for {}: job already in flight", req.ticker);
            return Ok(EnqueueOutcome::Skipped);
        }

        let job_id = result.last_insert_rowid();
        tracing::info!(
            "Enqueued job {} for {} (source: {}, priority: {})",
            job_id,
            req.ticker,
            req.source,
            req.priority.as_str()
        );
        Ok(EnqueueOutcome::Enqueued(job_id))
    }

    /// Claim the oldest eligible job: pending, due, ordered by priority then
    /// scheduling time then creation order. The claim is a single conditional
    /// UPDATE so concurrent workers can never claim the same row.
    pub async fn dequeue_next(&self) -> Result<Option<AnalysisJob>, AnalysisError> {
        let now = self.clock.now().to_rfc3339();

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE analysis_jobs
             SET status = 'processing', started_at = ?1
             WHERE id = (
                 SELECT id FROM analysis_jobs
                 WHERE status = 'pending' AND scheduled_at <= ?1
                 ORDER BY priority ASC, scheduled_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = row.into_job()?;

        // Single-flight audit: a second processing job for this ticker means
        // the enqueue guard was bypassed. Fatal, never silently repaired.
        let (others,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM analysis_jobs
             WHERE ticker = ?1 AND status = 'processing' AND id != ?2",
        )
        .bind(&job.ticker)
        .bind(job.id)
        .fetch_one(&self.pool)
        .await?;
        if others > 0 {
            tracing::error!(
                "Single-flight violation: {} other processing job(s) for {} besides job {}",
                others,
                job.ticker,
                job.id
            );
            return Err(AnalysisError::InvariantViolation(format!(
                "multiple processing jobs for ticker {}",
                job.ticker
            )));
        }

        Ok(Some(job))
    }

    /// Mark a job completed. Conditional on the job still being in
    /// `processing`: a superseded job must not flip back to completed.
    /// Returns whether the transition was recorded.
    pub async fn mark_completed(&self, job_id: i64) -> Result<bool, AnalysisError> {
        let now = self.clock.now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE analysis_jobs
             SET status = 'completed', completed_at = ?1, current_step = 'done',
                 error_message = NULL
             WHERE id = ?2 AND status = 'processing'",
        )
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                "Job {} was no longer processing; completion not recorded",
                job_id
            );
        }
        Ok(result.rows_affected() > 0)
    }

    /// Terminal failure.
    pub async fn mark_failed(&self, job_id: i64, error: &str) -> Result<(), AnalysisError> {
        let now = self.clock.now().to_rfc3339();
        sqlx::query(
            "UPDATE analysis_jobs
             SET status = 'failed', error_message = ?1, completed_at = ?2
             WHERE id = ?3",
        )
        .bind(error)
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt: bump the retry count and push the job back to
    /// pending with `scheduled_at = now + backoff`, or fail it terminally when
    /// retries are exhausted. Returns the resulting status.
    pub async fn mark_retry(
        &self,
        job_id: i64,
        error: &str,
        backoff_seconds: i64,
    ) -> Result<JobStatus, AnalysisError> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT retry_count, max_retries FROM analysis_jobs WHERE id = ?1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((retry_count, max_retries)) = row else {
            return Err(AnalysisError::InvariantViolation(format!(
                "mark_retry on unknown job {job_id}"
            )));
        };

        let next_retry = retry_count + 1;
        if next_retry >= max_retries {
            let now = self.clock.now().to_rfc3339();
            sqlx::query(
                "UPDATE analysis_jobs
                 SET status = 'failed', retry_count = ?1, error_message = ?2, completed_at = ?3
                 WHERE id = ?4",
            )
            .bind(next_retry)
            .bind(error)
            .bind(&now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            return Ok(JobStatus::Failed);
        }

        let next_at = (self.clock.now() + Duration::seconds(backoff_seconds)).to_rfc3339();
        sqlx::query(
            "UPDATE analysis_jobs
             SET status = 'pending', retry_count = ?1, scheduled_at = ?2,
                 error_message = ?3, started_at = NULL
             WHERE id = ?4",
        )
        .bind(next_retry)
        .bind(&next_at)
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(JobStatus::Pending)
    }

    /// Record pipeline progress for observability.
    pub async fn update_step(
        &self,
        job_id: i64,
        step: &str,
        details: &str,
    ) -> Result<(), AnalysisError> {
        sqlx::query("UPDATE analysis_jobs SET current_step = ?1, step_details = ?2 WHERE id = ?3")
            .bind(step)
            .bind(details)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recent job for a ticker, regardless of status.
    pub async fn latest_job(&self, ticker: &str) -> Result<Option<AnalysisJob>, AnalysisError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE ticker = ?1 ORDER BY id DESC LIMIT 1"
        ))
        .bind(&ticker.trim().to_uppercase())
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    /// Stale-write guard support: a claimed job is "current" for its ticker
    /// while its own row is still `processing`. A forced re-enqueue marks the
    /// row failed, which makes any still-running pipeline execution stale.
    pub async fn is_current_job(&self, job_id: i64) -> Result<bool, AnalysisError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM analysis_jobs WHERE id = ?1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(matches!(row, Some((status,)) if status == "processing"))
    }

    /// Job counts per status, for the operational health page.
    pub async fn counts_by_status(&self) -> Result<HashMap<String, i64>, AnalysisError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM analysis_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }
}
