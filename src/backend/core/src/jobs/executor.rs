//! Per-job lifecycle: claim, record the attempt, run the handler, reconcile.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{CompletionOutcome, ExecutorPermit, HandlerRegistry, Job, JobContext, JobStore};
use crate::error::{KilnError, Result};
use crate::telemetry::JobMetrics;

/// What happened to a job handed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Another claimant got the job first; nothing was touched
    ClaimLost,
    /// Attempt ran and was written back
    Completed(CompletionOutcome),
    /// Attempt ran but the job had left `running` (reaped) before reconcile
    Orphaned,
}

/// Drives one job through a single attempt. Never panics and never lets a
/// handler failure escape; only store errors are returned.
pub struct Executor {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    worker_id: Arc<str>,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        worker_id: impl Into<Arc<str>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            worker_id: worker_id.into(),
            shutdown,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn execute(&self, job: Job) -> Result<ExecutionOutcome> {
        if !self.store.mark_running(job.id, &self.worker_id).await? {
            let lost = KilnError::claim_lost(job.id.as_uuid());
            tracing::debug!(job_id = %job.id, kind = %job.kind, error = %lost, "Claim lost");
            JobMetrics::claim_lost(job.kind);
            return Ok(ExecutionOutcome::ClaimLost);
        }
        JobMetrics::claimed(job.kind);

        let attempt_id = match self.store.record_attempt_start(job.id).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to record attempt start");
                None
            }
        };

        tracing::debug!(
            job_id = %job.id,
            kind = %job.kind,
            attempt = job.attempt + 1,
            max_attempts = job.max_attempts,
            "Running job"
        );

        JobMetrics::started();
        let started = Instant::now();
        let result = self.invoke(&job).await;
        JobMetrics::finished(job.kind, started.elapsed());

        let error = result.err().map(|e| {
            tracing::warn!(
                job_id = %job.id,
                kind = %job.kind,
                error_code = %e.code(),
                error = %e,
                "Attempt failed"
            );
            e.to_string()
        });
        let success = error.is_none();

        if let Some(attempt_id) = attempt_id {
            if let Err(e) = self
                .store
                .record_attempt_finish(attempt_id, success, error.as_deref())
                .await
            {
                tracing::warn!(
                    job_id = %job.id,
                    attempt_id = %attempt_id,
                    error = %e,
                    "Failed to record attempt finish"
                );
            }
        }

        let Some(outcome) = self.store.complete(job.id, success, error.as_deref()).await? else {
            tracing::warn!(job_id = %job.id, "Job left running state before completion; result discarded");
            return Ok(ExecutionOutcome::Orphaned);
        };

        JobMetrics::completed(job.kind, &outcome);
        match outcome {
            CompletionOutcome::Succeeded => {
                tracing::info!(
                    job_id = %job.id,
                    kind = %job.kind,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Job succeeded"
                );
            }
            CompletionOutcome::Retrying { attempt, run_at } => {
                tracing::info!(
                    job_id = %job.id,
                    kind = %job.kind,
                    attempt = attempt,
                    max_attempts = job.max_attempts,
                    run_at = %run_at,
                    "Job requeued for retry"
                );
            }
            CompletionOutcome::Dead { attempts } => {
                tracing::error!(
                    job_id = %job.id,
                    kind = %job.kind,
                    attempts = attempts,
                    last_error = error.as_deref().unwrap_or_default(),
                    "Job exhausted its retry budget and was dead-lettered"
                );
            }
        }

        Ok(ExecutionOutcome::Completed(outcome))
    }

    /// Execute and settle the pool permit. Store failures are logged; the job
    /// stays `running` until the reaper returns it to the queue.
    pub async fn run(&self, job: Job, permit: ExecutorPermit) -> Option<ExecutionOutcome> {
        let job_id = job.id;
        match self.execute(job).await {
            Ok(outcome) => {
                match outcome {
                    ExecutionOutcome::Completed(CompletionOutcome::Succeeded) => permit.mark_success(),
                    ExecutionOutcome::Completed(_) => permit.mark_failure(),
                    ExecutionOutcome::ClaimLost | ExecutionOutcome::Orphaned => drop(permit),
                }
                Some(outcome)
            }
            Err(e) => {
                e.log();
                tracing::error!(job_id = %job_id, "Failed to reconcile job");
                permit.mark_failure();
                None
            }
        }
    }

    /// Run the handler with panic capture and its timeout.
    async fn invoke(&self, job: &Job) -> Result<()> {
        let handler = self.registry.get(job.kind)?;
        let ctx = JobContext::new(job.clone(), self.worker_id.clone(), self.shutdown.child_token());

        let guarded = AssertUnwindSafe(handler.handle(&ctx)).catch_unwind();
        let caught = match handler.timeout() {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| KilnError::handler_timeout(job.kind, limit))?,
            None => guarded.await,
        };

        match caught {
            Ok(Ok(())) => Ok(()),
            Ok(Err(job_error)) => Err(KilnError::handler_failed(job.kind, job_error.to_string())),
            Err(panic) => Err(KilnError::handler_panicked(job.kind, panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::{FnHandler, InMemoryJobStore, JobError, JobId, JobKind, JobStatus, NewJob, RetryPolicy};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryJobStore>,
        executor: Executor,
    }

    fn harness(registry: HandlerRegistry) -> Harness {
        let store = Arc::new(InMemoryJobStore::new(RetryPolicy::immediate()));
        let executor = Executor::new(
            store.clone(),
            Arc::new(registry),
            "test-worker",
            CancellationToken::new(),
        );
        Harness { store, executor }
    }

    async fn enqueue(store: &InMemoryJobStore, job: NewJob) -> Job {
        let id = store.enqueue(job).await.unwrap();
        store.get_job(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_success_path() {
        let h = harness(HandlerRegistry::new().register_fn(JobKind::Generic, |_ctx| async { Ok(()) }));
        let job = enqueue(&h.store, NewJob::new(JobKind::Generic, json!({}))).await;

        let outcome = h.executor.execute(job.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed(CompletionOutcome::Succeeded));

        let attempts = h.store.attempts_for(job.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].success, Some(true));
        assert_eq!(h.store.get_job(job.id).await.unwrap().unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_claim_lost_has_no_side_effects() {
        let h = harness(HandlerRegistry::new().register_fn(JobKind::Generic, |_ctx| async { Ok(()) }));
        let job = enqueue(&h.store, NewJob::new(JobKind::Generic, json!({}))).await;
        assert!(h.store.mark_running(job.id, "other-worker").await.unwrap());

        let outcome = h.executor.execute(job.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::ClaimLost);
        assert!(h.store.attempts_for(job.id).await.unwrap().is_empty());

        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.claimed_by.as_deref(), Some("other-worker"));
        assert_eq!(stored.attempt, 0);
    }

    #[tokio::test]
    async fn test_handler_error_recorded() {
        let h = harness(HandlerRegistry::new().register_fn(JobKind::SearchIndexer, |_ctx| async {
            Err(JobError::new("index offline"))
        }));
        let job = enqueue(&h.store, NewJob::new(JobKind::SearchIndexer, json!({}))).await;

        let outcome = h.executor.execute(job.clone()).await.unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Completed(CompletionOutcome::Retrying { attempt: 1, .. })
        ));

        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("index offline"));
        let attempts = h.store.attempts_for(job.id).await.unwrap();
        assert_eq!(attempts[0].success, Some(false));
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_attempt() {
        let h = harness(HandlerRegistry::new().register_fn(JobKind::Generic, |ctx| async move {
            if ctx.attempt() > 0 {
                panic!("handler exploded");
            }
            Ok(())
        }));
        let job = enqueue(&h.store, NewJob::new(JobKind::Generic, json!({})).with_max_attempts(1)).await;

        let outcome = h.executor.execute(job.clone()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed(CompletionOutcome::Dead { attempts: 1 }));

        let attempts = h.store.attempts_for(job.id).await.unwrap();
        assert_eq!(attempts[0].success, Some(false));
        assert!(attempts[0].error.as_deref().unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_unregistered_kind_consumes_budget() {
        let h = harness(HandlerRegistry::new());
        let job = enqueue(&h.store, NewJob::new(JobKind::AnalyticsExporter, json!({}))).await;

        h.executor.execute(job.clone()).await.unwrap();

        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt, 1);
        assert_eq!(stored.status, JobStatus::Queued);
        assert!(stored
            .last_error
            .unwrap()
            .contains(&ErrorCode::UnknownJobKind.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_attempt() {
        let registry = HandlerRegistry::new().register(
            FnHandler::new(JobKind::SyncCompactor, |_ctx| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .with_timeout(Some(Duration::from_secs(1))),
        );
        let h = harness(registry);
        let job = enqueue(&h.store, NewJob::new(JobKind::SyncCompactor, json!({}))).await;

        h.executor.execute(job.clone()).await.unwrap();
        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("HandlerTimeout"));
    }

    #[tokio::test]
    async fn test_orphaned_when_reaped_mid_run() {
        let store = Arc::new(InMemoryJobStore::new(RetryPolicy::immediate()));
        let reaper_store = store.clone();
        let registry = HandlerRegistry::new().register_fn(JobKind::Generic, move |_ctx| {
            let store = reaper_store.clone();
            async move {
                store.reap_stale(Duration::ZERO, None).await.map_err(JobError::from)?;
                Ok(())
            }
        });
        let executor = Executor::new(store.clone(), Arc::new(registry), "w1", CancellationToken::new());
        let job = enqueue(&store, NewJob::new(JobKind::Generic, json!({}))).await;

        assert_eq!(executor.execute(job.clone()).await.unwrap(), ExecutionOutcome::Orphaned);
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.attempt, 1);
    }

    #[tokio::test]
    async fn test_unknown_job_is_claim_lost() {
        let h = harness(HandlerRegistry::new());
        let mut job = enqueue(&h.store, NewJob::new(JobKind::Generic, json!({}))).await;
        job.id = JobId::new();
        assert_eq!(h.executor.execute(job).await.unwrap(), ExecutionOutcome::ClaimLost);
    }
}
