//! Persistence boundary of the job engine.

use async_trait::async_trait;
use std::time::Duration;

use super::{
    Attempt, AttemptId, CompletionOutcome, DeadLetter, Job, JobId, JobKind, NewJob, QueueStats,
    ReapReport,
};
use crate::error::Result;

/// System of record for jobs, attempts and dead letters.
///
/// Every method is its own transaction. `mark_running` and `complete` are the
/// only concurrency-control primitives: both are conditional on the current
/// status, so concurrent workers racing on the same row see at most one winner.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued job. Fails with `DuplicateJob` when `dedupe_key` is held
    /// by a non-terminal job.
    async fn enqueue(&self, job: NewJob) -> Result<JobId>;

    /// Queued jobs with `run_at <= now`, ordered `priority desc, run_at asc`.
    /// Never mutates state.
    async fn fetch_queued(&self, limit: usize) -> Result<Vec<Job>>;

    /// Transition `queued -> running` and stamp the claim. Returns false when the
    /// job was not queued (another claimant won, or it is terminal) or its
    /// `run_at` is still in the future.
    async fn mark_running(&self, job_id: JobId, worker_id: &str) -> Result<bool>;

    /// Reconcile a finished attempt. Only acts on `running` jobs; `None` means
    /// nothing changed. Exhausting the budget writes the dead letter in the same
    /// transaction as the transition to `dead`.
    async fn complete(
        &self,
        job_id: JobId,
        success: bool,
        error: Option<&str>,
    ) -> Result<Option<CompletionOutcome>>;

    async fn record_attempt_start(&self, job_id: JobId) -> Result<AttemptId>;

    async fn record_attempt_finish(
        &self,
        attempt_id: AttemptId,
        success: bool,
        error: Option<&str>,
    ) -> Result<()>;

    /// Reclaim `running` jobs claimed at least `older_than` ago, except
    /// `exclude`. The interrupted attempt is charged: jobs with budget left go
    /// back to `queued`, the rest move to `dead` and get their dead letter in
    /// the same transaction. Open attempt rows of reclaimed jobs are closed as
    /// failed.
    async fn reap_stale(&self, older_than: Duration, exclude: Option<JobId>) -> Result<ReapReport>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;

    async fn attempts_for(&self, job_id: JobId) -> Result<Vec<Attempt>>;

    /// `queued -> canceled`. False for any other status.
    async fn cancel(&self, job_id: JobId) -> Result<bool>;

    /// Delete terminal jobs (and their attempts) not updated since `older_than` ago.
    /// Dead letters survive with their job reference cleared.
    async fn purge_finished(&self, older_than: Duration) -> Result<u64>;

    /// Dead letters, newest first, optionally filtered by kind.
    async fn dead_letters(&self, kind: Option<JobKind>, limit: usize) -> Result<Vec<DeadLetter>>;

    async fn stats(&self) -> Result<QueueStats>;
}
