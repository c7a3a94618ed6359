//! In-memory job store for testing and development.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::time::Duration;

use super::{
    Attempt, AttemptId, CompletionOutcome, DeadLetter, Job, JobId, JobKind, JobStatus, JobStore,
    NewJob, QueueStats, ReapReport, RetryPolicy,
};
use crate::error::{ErrorCode, KilnError, Result};

#[derive(Default)]
struct MemoryState {
    /// Insertion order doubles as the final tie-breaker when fetching.
    jobs: Vec<Job>,
    attempts: Vec<Attempt>,
    dead_letters: Vec<DeadLetter>,
    next_attempt_id: i64,
    next_dead_letter_id: i64,
}

impl MemoryState {
    fn job_mut(&mut self, job_id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }
}

/// Store backed by process memory. Each operation holds a single lock, which
/// gives the same atomicity as the row-level conditions of the SQL store.
pub struct InMemoryJobStore {
    state: Mutex<MemoryState>,
    retry_policy: RetryPolicy,
}

impl InMemoryJobStore {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            retry_policy,
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

fn elapsed_cutoff(older_than: Duration) -> chrono::DateTime<Utc> {
    let age = chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() - age
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, new_job: NewJob) -> Result<JobId> {
        new_job.validate()?;

        let mut state = self.state.lock();
        if let Some(key) = &new_job.dedupe_key {
            let taken = state
                .jobs
                .iter()
                .any(|j| !j.status.is_terminal() && j.dedupe_key.as_deref() == Some(key.as_str()));
            if taken {
                return Err(KilnError::duplicate_job(key));
            }
        }

        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            kind: new_job.kind,
            priority: new_job.priority,
            run_at: new_job.run_at.unwrap_or(now),
            max_attempts: new_job.max_attempts,
            attempt: 0,
            dedupe_key: new_job.dedupe_key,
            payload: new_job.payload,
            status: JobStatus::Queued,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let id = job.id;
        state.jobs.push(job);
        Ok(id)
    }

    async fn fetch_queued(&self, limit: usize) -> Result<Vec<Job>> {
        let now = Utc::now();
        let state = self.state.lock();
        let mut due: Vec<Job> = state.jobs.iter().filter(|j| j.is_due(now)).cloned().collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.run_at.cmp(&b.run_at))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_running(&self, job_id: JobId, worker_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(job) = state.job_mut(job_id) else {
            return Ok(false);
        };
        let now = Utc::now();
        if !job.is_due(now) {
            return Ok(false);
        }
        job.status = JobStatus::Running;
        job.claimed_by = Some(worker_id.to_string());
        job.claimed_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn complete(
        &self,
        job_id: JobId,
        success: bool,
        error: Option<&str>,
    ) -> Result<Option<CompletionOutcome>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let Some(job) = state.job_mut(job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Running {
            return Ok(None);
        }

        job.attempt = (job.attempt + 1).min(job.max_attempts);
        job.claimed_by = None;
        job.claimed_at = None;
        job.updated_at = now;

        let outcome = if success {
            job.status = JobStatus::Succeeded;
            CompletionOutcome::Succeeded
        } else {
            job.last_error = error.map(str::to_string);
            self.retry_policy.on_failure(job.attempt, job.max_attempts, now)
        };

        match outcome {
            CompletionOutcome::Succeeded => {}
            CompletionOutcome::Retrying { run_at, .. } => {
                job.status = JobStatus::Queued;
                job.run_at = run_at;
            }
            CompletionOutcome::Dead { attempts } => {
                job.status = JobStatus::Dead;
                let (kind, payload, last_error) =
                    (job.kind, job.payload.clone(), job.last_error.clone());
                state.next_dead_letter_id += 1;
                let id = state.next_dead_letter_id;
                state.dead_letters.push(DeadLetter {
                    id,
                    job_id: Some(job_id),
                    kind,
                    payload,
                    attempts,
                    last_error,
                    created_at: now,
                });
            }
        }

        Ok(Some(outcome))
    }

    async fn record_attempt_start(&self, job_id: JobId) -> Result<AttemptId> {
        let mut state = self.state.lock();
        state.next_attempt_id += 1;
        let id = AttemptId(state.next_attempt_id);
        state.attempts.push(Attempt {
            id,
            job_id,
            started_at: Utc::now(),
            finished_at: None,
            success: None,
            error: None,
        });
        Ok(id)
    }

    async fn record_attempt_finish(
        &self,
        attempt_id: AttemptId,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let attempt = state
            .attempts
            .iter_mut()
            .find(|a| a.id == attempt_id && a.finished_at.is_none())
            .ok_or_else(|| {
                KilnError::new(
                    ErrorCode::RecordNotFound,
                    format!("Open attempt not found: {}", attempt_id),
                )
            })?;
        attempt.finished_at = Some(Utc::now());
        attempt.success = Some(success);
        attempt.error = error.map(str::to_string);
        Ok(())
    }

    async fn reap_stale(&self, older_than: Duration, exclude: Option<JobId>) -> Result<ReapReport> {
        let cutoff = elapsed_cutoff(older_than);
        let now = Utc::now();
        let mut guard = self.state.lock();
        let MemoryState {
            jobs,
            attempts,
            dead_letters,
            next_dead_letter_id,
            ..
        } = &mut *guard;

        let mut report = ReapReport::default();
        for job in jobs.iter_mut() {
            let stale = job.status == JobStatus::Running
                && Some(job.id) != exclude
                && job.claimed_at.map_or(true, |at| at <= cutoff);
            if !stale {
                continue;
            }

            let reason = format!(
                "reclaimed from stale worker {}",
                job.claimed_by.as_deref().unwrap_or("unknown")
            );
            for attempt in attempts
                .iter_mut()
                .filter(|a| a.job_id == job.id && a.finished_at.is_none())
            {
                attempt.finished_at = Some(now);
                attempt.success = Some(false);
                attempt.error = Some(reason.clone());
            }

            job.attempt = (job.attempt + 1).min(job.max_attempts);
            job.last_error = Some(reason);
            job.claimed_by = None;
            job.claimed_at = None;
            job.updated_at = now;

            if job.attempt >= job.max_attempts {
                job.status = JobStatus::Dead;
                *next_dead_letter_id += 1;
                dead_letters.push(DeadLetter {
                    id: *next_dead_letter_id,
                    job_id: Some(job.id),
                    kind: job.kind,
                    payload: job.payload.clone(),
                    attempts: job.attempt,
                    last_error: job.last_error.clone(),
                    created_at: now,
                });
                report.dead += 1;
            } else {
                job.status = JobStatus::Queued;
                report.requeued += 1;
            }
        }
        Ok(report)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn attempts_for(&self, job_id: JobId) -> Result<Vec<Attempt>> {
        Ok(self
            .state
            .lock()
            .attempts
            .iter()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn cancel(&self, job_id: JobId) -> Result<bool> {
        let mut state = self.state.lock();
        match state.job_mut(job_id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Canceled;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_finished(&self, older_than: Duration) -> Result<u64> {
        let cutoff = elapsed_cutoff(older_than);
        let mut state = self.state.lock();

        let (purged, kept): (Vec<Job>, Vec<Job>) = std::mem::take(&mut state.jobs)
            .into_iter()
            .partition(|j| j.status.is_terminal() && j.updated_at < cutoff);
        state.jobs = kept;

        for job in &purged {
            state.attempts.retain(|a| a.job_id != job.id);
            for letter in state.dead_letters.iter_mut().filter(|d| d.job_id == Some(job.id)) {
                letter.job_id = None;
            }
        }
        Ok(purged.len() as u64)
    }

    async fn dead_letters(&self, kind: Option<JobKind>, limit: usize) -> Result<Vec<DeadLetter>> {
        let state = self.state.lock();
        Ok(state
            .dead_letters
            .iter()
            .rev()
            .filter(|d| kind.map_or(true, |k| d.kind == k))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock();
        let mut stats = QueueStats {
            dead_letters: state.dead_letters.len() as u64,
            ..QueueStats::default()
        };
        for job in &state.jobs {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Canceled => stats.canceled += 1,
                JobStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::BackoffStrategy;
    use serde_json::json;

    async fn claimed(store: &InMemoryJobStore, job: NewJob) -> JobId {
        let id = store.enqueue(job).await.unwrap();
        assert!(store.mark_running(id, "test-worker").await.unwrap());
        id
    }

    #[tokio::test]
    async fn test_enqueue_and_fetch() {
        let store = InMemoryJobStore::default();
        let id = store
            .enqueue(NewJob::new(JobKind::SearchIndexer, json!({"doc": 1})))
            .await
            .unwrap();

        let fetched = store.fetch_queued(10).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, id);
        assert_eq!(fetched[0].status, JobStatus::Queued);
        assert_eq!(fetched[0].attempt, 0);
    }

    #[tokio::test]
    async fn test_fetch_is_read_only() {
        let store = InMemoryJobStore::default();
        store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();

        assert_eq!(store.fetch_queued(10).await.unwrap().len(), 1);
        assert_eq!(store.fetch_queued(10).await.unwrap().len(), 1);
        assert_eq!(store.stats().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn test_fetch_respects_limit() {
        let store = InMemoryJobStore::default();
        for _ in 0..5 {
            store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();
        }
        assert_eq!(store.fetch_queued(3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_mark_running_only_from_queued() {
        let store = InMemoryJobStore::default();
        let id = store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();

        assert!(store.mark_running(id, "w1").await.unwrap());
        let before = store.get_job(id).await.unwrap().unwrap();
        assert!(!store.mark_running(id, "w2").await.unwrap());
        let after = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(after.claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_mark_running_unknown_job() {
        let store = InMemoryJobStore::default();
        assert!(!store.mark_running(JobId::new(), "w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_success() {
        let store = InMemoryJobStore::default();
        let id = claimed(&store, NewJob::new(JobKind::Generic, json!({}))).await;

        let outcome = store.complete(id, true, None).await.unwrap();
        assert_eq!(outcome, Some(CompletionOutcome::Succeeded));

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.claimed_by.is_none());
        assert_eq!(job.attempt, 1);
    }

    #[tokio::test]
    async fn test_complete_requires_running() {
        let store = InMemoryJobStore::default();
        let id = store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();
        assert_eq!(store.complete(id, true, None).await.unwrap(), None);
        assert_eq!(store.get_job(id).await.unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_failure_requeues_with_backoff() {
        let store = InMemoryJobStore::new(RetryPolicy::new(BackoffStrategy::fixed(60)));
        let id = claimed(&store, NewJob::new(JobKind::Generic, json!({})).with_max_attempts(3)).await;

        let outcome = store.complete(id, false, Some("boom")).await.unwrap().unwrap();
        assert!(matches!(outcome, CompletionOutcome::Retrying { attempt: 1, .. }));

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert!(job.run_at > Utc::now());
        assert!(store.fetch_queued(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_writes_one_dead_letter() {
        let store = InMemoryJobStore::new(RetryPolicy::immediate());
        let id = store
            .enqueue(NewJob::new(JobKind::RuleExecutor, json!({"rule": 9})).with_max_attempts(2))
            .await
            .unwrap();

        for _ in 0..2 {
            assert!(store.mark_running(id, "w1").await.unwrap());
            store.complete(id, false, Some("rule blew up")).await.unwrap();
        }

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.attempt, 2);

        let letters = store.dead_letters(None, 10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job_id, Some(id));
        assert_eq!(letters[0].attempts, 2);
        assert_eq!(letters[0].payload, json!({"rule": 9}));
        assert_eq!(letters[0].last_error.as_deref(), Some("rule blew up"));

        assert!(!store.mark_running(id, "w1").await.unwrap());
        assert_eq!(store.complete(id, false, Some("again")).await.unwrap(), None);
        assert_eq!(store.dead_letters(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letters_filter_by_kind() {
        let store = InMemoryJobStore::new(RetryPolicy::immediate());
        for kind in [JobKind::SearchIndexer, JobKind::SyncCompactor] {
            let id = claimed(&store, NewJob::new(kind, json!({})).with_max_attempts(1)).await;
            store.complete(id, false, Some("nope")).await.unwrap();
        }

        let indexer = store.dead_letters(Some(JobKind::SearchIndexer), 10).await.unwrap();
        assert_eq!(indexer.len(), 1);
        assert_eq!(indexer[0].kind, JobKind::SearchIndexer);
        assert_eq!(store.dead_letters(None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_attempt_log() {
        let store = InMemoryJobStore::default();
        let id = claimed(&store, NewJob::new(JobKind::Generic, json!({}))).await;

        let attempt = store.record_attempt_start(id).await.unwrap();
        let open = store.attempts_for(id).await.unwrap();
        assert_eq!(open[0].success, None);
        assert!(open[0].finished_at.is_none());

        store.record_attempt_finish(attempt, false, Some("bad")).await.unwrap();
        let closed = store.attempts_for(id).await.unwrap();
        assert_eq!(closed[0].success, Some(false));
        assert_eq!(closed[0].error.as_deref(), Some("bad"));

        assert!(store.record_attempt_finish(attempt, true, None).await.is_err());
    }

    #[tokio::test]
    async fn test_reap_stale() {
        let store = InMemoryJobStore::default();
        let id = claimed(&store, NewJob::new(JobKind::Generic, json!({}))).await;
        let attempt = store.record_attempt_start(id).await.unwrap();

        let fresh = store.reap_stale(Duration::from_secs(600), None).await.unwrap();
        assert_eq!(fresh.total(), 0);
        let stale = store.reap_stale(Duration::ZERO, None).await.unwrap();
        assert_eq!(stale, ReapReport { requeued: 1, dead: 0 });

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.claimed_by.is_none());
        assert_eq!(job.attempt, 1);

        let attempts = store.attempts_for(id).await.unwrap();
        assert_eq!(attempts[0].success, Some(false));
        assert!(attempts[0].error.as_deref().unwrap().contains("test-worker"));
        assert!(store.record_attempt_finish(attempt, true, None).await.is_err());
    }

    #[tokio::test]
    async fn test_reap_skips_excluded_job() {
        let store = InMemoryJobStore::default();
        let own = claimed(&store, NewJob::new(JobKind::Generic, json!({}))).await;
        let other = claimed(&store, NewJob::new(JobKind::Generic, json!({}))).await;

        let report = store.reap_stale(Duration::ZERO, Some(own)).await.unwrap();
        assert_eq!(report.total(), 1);
        assert_eq!(store.get_job(own).await.unwrap().unwrap().status, JobStatus::Running);
        assert_eq!(store.get_job(other).await.unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_repeated_reaping_exhausts_budget() {
        let store = InMemoryJobStore::default();
        let id = store
            .enqueue(NewJob::new(JobKind::SyncCompactor, json!({"shard": 4})).with_max_attempts(2))
            .await
            .unwrap();

        for worker in ["crashed-1", "crashed-2"] {
            assert!(store.mark_running(id, worker).await.unwrap());
            store.reap_stale(Duration::ZERO, None).await.unwrap();
        }

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.attempt, 2);
        assert!(!store.mark_running(id, "w1").await.unwrap());

        let letters = store.dead_letters(None, 10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 2);
        assert_eq!(letters[0].payload, json!({"shard": 4}));
        assert!(letters[0].last_error.as_deref().unwrap().contains("crashed-2"));
    }

    #[tokio::test]
    async fn test_mark_running_requires_due_job() {
        let store = InMemoryJobStore::new(RetryPolicy::new(BackoffStrategy::fixed(3600)));
        let id = store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();
        let snapshot = store.fetch_queued(1).await.unwrap().remove(0);

        assert!(store.mark_running(id, "w2").await.unwrap());
        store.complete(id, false, Some("boom")).await.unwrap();

        assert!(!store.mark_running(snapshot.id, "w1").await.unwrap());
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_cancel_only_queued() {
        let store = InMemoryJobStore::default();
        let queued = store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();
        let running = claimed(&store, NewJob::new(JobKind::Generic, json!({}))).await;

        assert!(store.cancel(queued).await.unwrap());
        assert!(!store.cancel(running).await.unwrap());
        assert!(!store.mark_running(queued, "w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_finished_keeps_dead_letters() {
        let store = InMemoryJobStore::new(RetryPolicy::immediate());
        let id = claimed(&store, NewJob::new(JobKind::Generic, json!({})).with_max_attempts(1)).await;
        store.record_attempt_start(id).await.unwrap();
        store.complete(id, false, Some("x")).await.unwrap();
        let pending = store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();

        assert_eq!(store.purge_finished(Duration::ZERO).await.unwrap(), 1);
        assert!(store.get_job(id).await.unwrap().is_none());
        assert!(store.attempts_for(id).await.unwrap().is_empty());
        assert!(store.get_job(pending).await.unwrap().is_some());

        let letters = store.dead_letters(None, 10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job_id, None);
    }
}
