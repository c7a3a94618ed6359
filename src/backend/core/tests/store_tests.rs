//! Behavioural tests for `JobStore` implementations.
//!
//! The same checks run against the in-memory store and, when
//! `KILN_TEST_DATABASE_URL` points at a scratch database, against PostgreSQL.
//!
//! Tests cover:
//! - Enqueue validation and dedupe keys
//! - Claim exclusivity and due-time checks
//! - Retry, dead-lettering and attempt history
//! - Cancellation, reaping and purging
//! - Reaping charges the interrupted attempt

use chrono::Utc;
use kiln_core::error::ErrorCode;
use kiln_core::jobs::{
    BackoffStrategy, CompletionOutcome, InMemoryJobStore, JobKind, JobStatus, JobStore, NewJob,
    ReapReport, RetryPolicy,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Shared checks
// ============================================================================

fn unique_key(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

async fn check_dedupe(store: &dyn JobStore) {
    let key = unique_key("rebuild");
    let first = store
        .enqueue(NewJob::new(JobKind::ClusterRebuilder, json!({})).with_dedupe_key(&key))
        .await
        .unwrap();

    let err = store
        .enqueue(NewJob::new(JobKind::ClusterRebuilder, json!({})).with_dedupe_key(&key))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateJob);

    assert!(store.mark_running(first, "w1").await.unwrap());
    store.complete(first, true, None).await.unwrap();

    let second = store
        .enqueue(NewJob::new(JobKind::ClusterRebuilder, json!({})).with_dedupe_key(&key))
        .await
        .unwrap();
    assert_ne!(first, second);
}

async fn check_validation(store: &dyn JobStore) {
    let err = store
        .enqueue(NewJob::new(JobKind::Generic, json!({})).with_max_attempts(0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

async fn check_claim_is_exclusive(store: &dyn JobStore) {
    let id = store.enqueue(NewJob::new(JobKind::SyncCompactor, json!({}))).await.unwrap();

    assert!(store.mark_running(id, "w1").await.unwrap());
    assert!(!store.mark_running(id, "w2").await.unwrap());

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.claimed_by.as_deref(), Some("w1"));

    store.complete(id, true, None).await.unwrap();
    assert!(!store.mark_running(id, "w2").await.unwrap());
    assert_eq!(store.complete(id, true, None).await.unwrap(), None);
}

async fn check_retry_then_dead(store: &dyn JobStore) {
    let id = store
        .enqueue(NewJob::new(JobKind::AnalyticsExporter, json!({"batch": 3})).with_max_attempts(2))
        .await
        .unwrap();

    for n in 1..=2i16 {
        assert!(store.mark_running(id, "w1").await.unwrap());
        let attempt = store.record_attempt_start(id).await.unwrap();
        let error = format!("export failed #{}", n);
        store.record_attempt_finish(attempt, false, Some(&error)).await.unwrap();
        let outcome = store.complete(id, false, Some(&error)).await.unwrap().unwrap();
        if n == 1 {
            assert!(matches!(outcome, CompletionOutcome::Retrying { attempt: 1, .. }));
        } else {
            assert_eq!(outcome, CompletionOutcome::Dead { attempts: 2 });
        }
    }

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.last_error.as_deref(), Some("export failed #2"));

    let attempts = store.attempts_for(id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a.success == Some(false) && a.finished_at.is_some()));

    let letters = store.dead_letters(Some(JobKind::AnalyticsExporter), 100).await.unwrap();
    let letter = letters.iter().find(|l| l.job_id == Some(id)).unwrap();
    assert_eq!(letter.attempts, 2);
    assert_eq!(letter.payload, json!({"batch": 3}));
}

async fn check_future_jobs_not_fetched(store: &dyn JobStore) {
    let later = Utc::now() + chrono::Duration::hours(1);
    let id = store
        .enqueue(NewJob::new(JobKind::NotificationDispatcher, json!({})).run_at(later))
        .await
        .unwrap();

    let due = store.fetch_queued(1000).await.unwrap();
    assert!(due.iter().all(|j| j.id != id));
}

async fn check_claim_requires_due(store: &dyn JobStore) {
    let later = Utc::now() + chrono::Duration::hours(1);
    let id = store
        .enqueue(NewJob::new(JobKind::NotificationDispatcher, json!({})).run_at(later))
        .await
        .unwrap();

    assert!(!store.mark_running(id, "w1").await.unwrap());
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.claimed_by.is_none());
}

async fn check_cancel(store: &dyn JobStore) {
    let queued = store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();
    assert!(store.cancel(queued).await.unwrap());
    assert_eq!(store.get_job(queued).await.unwrap().unwrap().status, JobStatus::Canceled);
    assert!(!store.cancel(queued).await.unwrap());

    let running = store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();
    store.mark_running(running, "w1").await.unwrap();
    assert!(!store.cancel(running).await.unwrap());
}

async fn check_reap(store: &dyn JobStore) {
    let id = store.enqueue(NewJob::new(JobKind::SearchIndexer, json!({}))).await.unwrap();
    store.mark_running(id, "crashed-worker").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let attempt = store.record_attempt_start(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert!(store.reap_stale(Duration::ZERO, None).await.unwrap().requeued >= 1);

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 1);
    assert!(job.claimed_by.is_none());
    assert!(job.last_error.unwrap().contains("crashed-worker"));

    let attempts = store.attempts_for(id).await.unwrap();
    assert_eq!(attempts[0].success, Some(false));
    assert!(attempts[0].finished_at.is_some());
    assert!(store.record_attempt_finish(attempt, true, None).await.is_err());
}

async fn check_reap_skips_excluded(store: &dyn JobStore) {
    let id = store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();
    store.mark_running(id, "maintenance-worker").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    store.reap_stale(Duration::ZERO, Some(id)).await.unwrap();
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.attempt, 0);

    store.complete(id, true, None).await.unwrap();
}

async fn check_reap_exhausts_budget(store: &dyn JobStore) {
    let id = store
        .enqueue(NewJob::new(JobKind::ClusterRebuilder, json!({"cluster": 7})).with_max_attempts(2))
        .await
        .unwrap();

    for worker in ["crashed-a", "crashed-b"] {
        assert!(store.mark_running(id, worker).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.reap_stale(Duration::ZERO, None).await.unwrap();
    }

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.attempt, 2);

    let letters = store.dead_letters(Some(JobKind::ClusterRebuilder), 100).await.unwrap();
    let letter = letters.iter().find(|l| l.job_id == Some(id)).unwrap();
    assert_eq!(letter.attempts, 2);
    assert_eq!(letter.payload, json!({"cluster": 7}));
    assert!(letter.last_error.as_deref().unwrap().contains("crashed-b"));
    assert_eq!(letters.iter().filter(|l| l.job_id == Some(id)).count(), 1);
}

async fn run_contract(store: Arc<dyn JobStore>) {
    check_validation(store.as_ref()).await;
    check_dedupe(store.as_ref()).await;
    check_claim_is_exclusive(store.as_ref()).await;
    check_retry_then_dead(store.as_ref()).await;
    check_future_jobs_not_fetched(store.as_ref()).await;
    check_claim_requires_due(store.as_ref()).await;
    check_cancel(store.as_ref()).await;
    check_reap(store.as_ref()).await;
    check_reap_skips_excluded(store.as_ref()).await;
    check_reap_exhausts_budget(store.as_ref()).await;
}

// ============================================================================
// In-memory store
// ============================================================================

#[tokio::test]
async fn test_memory_store_contract() {
    run_contract(Arc::new(InMemoryJobStore::new(RetryPolicy::immediate()))).await;
}

#[tokio::test]
async fn test_memory_store_fetch_order() {
    let store = InMemoryJobStore::new(RetryPolicy::immediate());
    for priority in [1, 5, 3] {
        store
            .enqueue(NewJob::new(JobKind::RuleExecutor, json!({})).with_priority(priority))
            .await
            .unwrap();
    }

    let priorities: Vec<i16> = store
        .fetch_queued(10)
        .await
        .unwrap()
        .iter()
        .map(|j| j.priority)
        .collect();
    assert_eq!(priorities, vec![5, 3, 1]);
}

#[tokio::test]
async fn test_memory_store_stale_snapshot_cannot_skip_backoff() {
    let store = InMemoryJobStore::new(RetryPolicy::new(BackoffStrategy::fixed(3600)));
    let id = store.enqueue(NewJob::new(JobKind::SearchIndexer, json!({}))).await.unwrap();

    // Worker A buffers the row, then worker B claims and fails it.
    let snapshot = store.fetch_queued(10).await.unwrap().remove(0);
    assert!(store.mark_running(id, "worker-b").await.unwrap());
    let outcome = store.complete(id, false, Some("index offline")).await.unwrap().unwrap();
    assert!(matches!(outcome, CompletionOutcome::Retrying { attempt: 1, .. }));

    assert!(store.fetch_queued(10).await.unwrap().is_empty());
    assert!(!store.mark_running(snapshot.id, "worker-a").await.unwrap());
    assert_eq!(store.get_job(id).await.unwrap().unwrap().attempt, 1);
}

#[tokio::test]
async fn test_memory_store_reap_report() {
    let store = InMemoryJobStore::new(RetryPolicy::immediate());
    let last_chance = store
        .enqueue(NewJob::new(JobKind::Generic, json!({})).with_max_attempts(1))
        .await
        .unwrap();
    let retryable = store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();
    for id in [last_chance, retryable] {
        store.mark_running(id, "w1").await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = store.reap_stale(Duration::ZERO, None).await.unwrap();
    assert_eq!(report, ReapReport { requeued: 1, dead: 1 });
    assert_eq!(store.stats().await.unwrap().dead_letters, 1);
}

#[tokio::test]
async fn test_memory_store_purge_keeps_dead_letters() {
    let store = InMemoryJobStore::new(RetryPolicy::immediate());
    let id = store
        .enqueue(NewJob::new(JobKind::Generic, json!({})).with_max_attempts(1))
        .await
        .unwrap();
    store.mark_running(id, "w1").await.unwrap();
    store.complete(id, false, Some("boom")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(store.purge_finished(Duration::ZERO).await.unwrap(), 1);
    assert!(store.get_job(id).await.unwrap().is_none());

    let letters = store.dead_letters(None, 10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job_id, None);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.dead, 0);
    assert_eq!(stats.dead_letters, 1);
}

// ============================================================================
// PostgreSQL store
// ============================================================================

#[tokio::test]
#[ignore = "requires PostgreSQL via KILN_TEST_DATABASE_URL"]
async fn test_postgres_store_contract() {
    use kiln_core::config::DatabaseConfig;
    use kiln_core::db::Database;

    let url = std::env::var("KILN_TEST_DATABASE_URL").expect("KILN_TEST_DATABASE_URL not set");
    let db = Database::new(&DatabaseConfig::new(url)).await.unwrap();
    db.migrate().await.unwrap();

    run_contract(Arc::new(db.job_store(RetryPolicy::immediate()))).await;
}
