//! PostgreSQL job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;

use super::{
    Attempt, AttemptId, CompletionOutcome, DeadLetter, Job, JobId, JobKind, JobStatus, JobStore,
    NewJob, QueueStats, ReapReport, RetryPolicy,
};
use crate::error::{ErrorCode, KilnError, Result};

const JOB_COLUMNS: &str = "id, kind, priority, run_at, max_attempts, attempt, dedupe_key, payload, \
     status, claimed_by, claimed_at, last_error, created_at, updated_at";

/// Production store. Claims and completions are single conditional
/// statements or row-locked transactions, so any number of workers may share
/// one database. Every timestamp comes from the database clock.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    retry_policy: RetryPolicy,
}

impl PgJobStore {
    pub fn new(pool: PgPool, retry_policy: RetryPolicy) -> Self {
        Self { pool, retry_policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct ReapedRow {
    id: JobId,
    status: JobStatus,
}

#[derive(sqlx::FromRow)]
struct RunningRow {
    kind: JobKind,
    attempt: i16,
    max_attempts: i16,
    payload: serde_json::Value,
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<JobId> {
        new_job.validate()?;

        let id = JobId::new();
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, priority, run_at, max_attempts, attempt, dedupe_key, payload, status)
            VALUES ($1, $2, $3, COALESCE($4, NOW()), $5, 0, $6, $7, 'queued')
            "#,
        )
        .bind(id)
        .bind(new_job.kind)
        .bind(new_job.priority)
        .bind(new_job.run_at)
        .bind(new_job.max_attempts)
        .bind(&new_job.dedupe_key)
        .bind(&new_job.payload)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(job_id = %id, kind = %new_job.kind, "Job enqueued");
                Ok(id)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                KilnError::duplicate_job(new_job.dedupe_key.as_deref().unwrap_or_default()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_queued(&self, limit: usize) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'queued' AND run_at <= NOW()
            ORDER BY priority DESC, run_at ASC, created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn mark_running(&self, job_id: JobId, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', claimed_by = $2, claimed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'queued' AND run_at <= NOW()
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        job_id: JobId,
        success: bool,
        error: Option<&str>,
    ) -> Result<Option<CompletionOutcome>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, RunningRow>(
            r#"
            SELECT kind, attempt, max_attempts, payload
            FROM jobs
            WHERE id = $1 AND status = 'running'
            FOR UPDATE
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let attempt = (row.attempt + 1).min(row.max_attempts);
        let retry_delay = if success {
            None
        } else {
            self.retry_policy.retry_delay(attempt, row.max_attempts)
        };
        let status = match (success, retry_delay) {
            (true, _) => JobStatus::Succeeded,
            (false, Some(_)) => JobStatus::Queued,
            (false, None) => JobStatus::Dead,
        };

        let run_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = $2,
                attempt = $3,
                last_error = CASE WHEN $4 THEN last_error ELSE $5 END,
                run_at = CASE
                    WHEN $6::float8 IS NULL THEN run_at
                    ELSE NOW() + make_interval(secs => $6::float8)
                END,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING run_at
            "#,
        )
        .bind(job_id)
        .bind(status)
        .bind(attempt)
        .bind(success)
        .bind(error)
        .bind(retry_delay.map(|d| d.as_secs_f64()))
        .fetch_one(&mut *tx)
        .await?;

        let outcome = match status {
            JobStatus::Succeeded => CompletionOutcome::Succeeded,
            JobStatus::Queued => CompletionOutcome::Retrying { attempt, run_at },
            _ => CompletionOutcome::Dead { attempts: attempt },
        };

        if let CompletionOutcome::Dead { attempts } = outcome {
            sqlx::query(
                r#"
                INSERT INTO dead_letters (job_id, kind, payload, attempts, last_error, created_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                "#,
            )
            .bind(job_id)
            .bind(row.kind)
            .bind(&row.payload)
            .bind(attempts)
            .bind(error)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(outcome))
    }

    async fn record_attempt_start(&self, job_id: JobId) -> Result<AttemptId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO job_attempts (job_id, started_at) VALUES ($1, NOW()) RETURNING id",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(AttemptId(id))
    }

    async fn record_attempt_finish(
        &self,
        attempt_id: AttemptId,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_attempts
            SET finished_at = NOW(), success = $2, error = $3
            WHERE id = $1 AND finished_at IS NULL
            "#,
        )
        .bind(attempt_id)
        .bind(success)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(KilnError::new(
                ErrorCode::RecordNotFound,
                format!("Open attempt not found: {}", attempt_id),
            ));
        }
        Ok(())
    }

    async fn reap_stale(&self, older_than: Duration, exclude: Option<JobId>) -> Result<ReapReport> {
        let mut tx = self.pool.begin().await?;

        // SET expressions read the pre-update row; RETURNING sees the new one.
        let reaped = sqlx::query_as::<_, ReapedRow>(
            r#"
            WITH stale AS (
                SELECT id FROM jobs
                WHERE status = 'running'
                  AND (claimed_at IS NULL OR claimed_at <= NOW() - make_interval(secs => $1))
                  AND ($2::uuid IS NULL OR id <> $2)
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET attempt = LEAST(j.attempt + 1, j.max_attempts),
                status = CASE
                    WHEN j.attempt + 1 >= j.max_attempts THEN 'dead'::job_status
                    ELSE 'queued'::job_status
                END,
                last_error = 'reclaimed from stale worker ' || COALESCE(j.claimed_by, 'unknown'),
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            FROM stale
            WHERE j.id = stale.id
            RETURNING j.id, j.status
            "#,
        )
        .bind(older_than.as_secs_f64())
        .bind(exclude)
        .fetch_all(&mut *tx)
        .await?;

        if reaped.is_empty() {
            tx.commit().await?;
            return Ok(ReapReport::default());
        }

        let ids: Vec<uuid::Uuid> = reaped.iter().map(|r| r.id.as_uuid()).collect();
        let dead: Vec<uuid::Uuid> = reaped
            .iter()
            .filter(|r| r.status == JobStatus::Dead)
            .map(|r| r.id.as_uuid())
            .collect();

        sqlx::query(
            r#"
            UPDATE job_attempts a
            SET finished_at = NOW(), success = FALSE, error = j.last_error
            FROM jobs j
            WHERE a.job_id = j.id AND j.id = ANY($1) AND a.finished_at IS NULL
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        if !dead.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO dead_letters (job_id, kind, payload, attempts, last_error, created_at)
                SELECT id, kind, payload, attempt, last_error, NOW()
                FROM jobs
                WHERE id = ANY($1)
                "#,
            )
            .bind(&dead)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let dead = dead.len() as u64;
        Ok(ReapReport {
            requeued: reaped.len() as u64 - dead,
            dead,
        })
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn attempts_for(&self, job_id: JobId) -> Result<Vec<Attempt>> {
        let attempts = sqlx::query_as::<_, Attempt>(
            r#"
            SELECT id, job_id, started_at, finished_at, success, error
            FROM job_attempts
            WHERE job_id = $1
            ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(attempts)
    }

    async fn cancel(&self, job_id: JobId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'canceled', updated_at = NOW() WHERE id = $1 AND status = 'queued'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn purge_finished(&self, older_than: Duration) -> Result<u64> {
        // Attempts cascade; dead letters keep their snapshot with job_id nulled.
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('succeeded', 'canceled', 'dead')
              AND updated_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn dead_letters(&self, kind: Option<JobKind>, limit: usize) -> Result<Vec<DeadLetter>> {
        let letters = sqlx::query_as::<_, DeadLetter>(
            r#"
            SELECT id, job_id, kind, payload, attempts, last_error, created_at
            FROM dead_letters
            WHERE $1::job_kind IS NULL OR kind = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(kind)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(letters)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let counts: Vec<(JobStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let dead_letters: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;

        let mut stats = QueueStats {
            dead_letters: dead_letters as u64,
            ..QueueStats::default()
        };
        for (status, count) in counts {
            let count = count as u64;
            match status {
                JobStatus::Queued => stats.queued = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Succeeded => stats.succeeded = count,
                JobStatus::Failed => stats.failed = count,
                JobStatus::Canceled => stats.canceled = count,
                JobStatus::Dead => stats.dead = count,
            }
        }
        Ok(stats)
    }
}
