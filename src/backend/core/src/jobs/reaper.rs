//! Reaper: returns jobs stuck in `running` to the queue.
//!
//! A worker that dies mid-attempt leaves its claim behind. Any claim older than
//! `stale_after` is treated as abandoned and the interrupted attempt is
//! charged, so a job that keeps killing its worker still ends up dead-lettered.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{JobStore, ReapReport, MIN_LOOP_INTERVAL};
use crate::error::Result;
use crate::telemetry::JobMetrics;

pub struct Reaper {
    store: Arc<dyn JobStore>,
    stale_after: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, stale_after: Duration, interval: Duration) -> Self {
        Self {
            store,
            stale_after,
            interval: interval.max(MIN_LOOP_INTERVAL),
        }
    }

    pub async fn reap_once(&self) -> Result<ReapReport> {
        let report = self.store.reap_stale(self.stale_after, None).await?;
        if report.total() > 0 {
            JobMetrics::reaped(report.total());
            tracing::warn!(
                requeued = report.requeued,
                dead = report.dead,
                stale_after_secs = self.stale_after.as_secs(),
                "Reclaimed stale running jobs"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` fires. The first sweep happens
    /// one full interval after start; the worker sweeps once on its own at
    /// start-up.
    pub async fn run(self, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        e.log();
                    }
                }
            }
        }

        tracing::debug!("Reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobKind, JobStatus, NewJob};
    use serde_json::json;

    #[tokio::test]
    async fn test_reap_once_leaves_fresh_claims() {
        let store = Arc::new(InMemoryJobStore::default());
        let id = store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();
        store.mark_running(id, "w1").await.unwrap();

        let patient = Reaper::new(store.clone(), Duration::from_secs(900), Duration::from_secs(60));
        assert_eq!(patient.reap_once().await.unwrap().total(), 0);
        assert_eq!(store.get_job(id).await.unwrap().unwrap().status, JobStatus::Running);

        let eager = Reaper::new(store.clone(), Duration::ZERO, Duration::from_secs(60));
        assert_eq!(eager.reap_once().await.unwrap().requeued, 1);

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 1);
        assert!(job.last_error.unwrap().contains("w1"));
    }

    #[tokio::test]
    async fn test_zero_interval_still_ticks() {
        let store = Arc::new(InMemoryJobStore::default());
        let id = store.enqueue(NewJob::new(JobKind::Generic, json!({}))).await.unwrap();
        store.mark_running(id, "w1").await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Reaper::new(store.clone(), Duration::ZERO, Duration::ZERO).run(shutdown.clone()));

        for _ in 0..200 {
            if store.get_job(id).await.unwrap().unwrap().status == JobStatus::Queued {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(store.get_job(id).await.unwrap().unwrap().status, JobStatus::Queued);
    }
}
