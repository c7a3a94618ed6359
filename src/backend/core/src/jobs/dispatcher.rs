//! Dispatcher: drains the pending buffer into executor tasks.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::{Executor, ExecutorPermit, ExecutorPool, Job, PendingBuffer, MIN_LOOP_INTERVAL};
use crate::telemetry::JobMetrics;

pub struct Dispatcher {
    buffer: Arc<PendingBuffer>,
    pool: Arc<ExecutorPool>,
    executor: Arc<Executor>,
    tracker: TaskTracker,
    idle_interval: Duration,
    cooldown: Duration,
}

impl Dispatcher {
    pub fn new(
        buffer: Arc<PendingBuffer>,
        pool: Arc<ExecutorPool>,
        executor: Arc<Executor>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            buffer,
            pool,
            executor,
            tracker,
            idle_interval: Duration::from_secs(1),
            cooldown: Duration::from_millis(500),
        }
    }

    pub fn with_intervals(mut self, idle_interval: Duration, cooldown: Duration) -> Self {
        self.idle_interval = idle_interval.max(MIN_LOOP_INTERVAL);
        self.cooldown = cooldown.max(MIN_LOOP_INTERVAL);
        self
    }

    /// Drain until `shutdown` fires. Each job gets its own task on the
    /// tracker; the loop never waits for one to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            max_concurrency = self.pool.max_concurrency(),
            "Dispatcher started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let Some(job) = self.buffer.pop() else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.buffer.notified() => {}
                    _ = tokio::time::sleep(self.idle_interval) => {}
                }
                continue;
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.buffer.release(job.id);
                    break;
                }
                permit = self.pool.acquire() => permit,
            };

            match permit {
                Ok(permit) => self.spawn(job, permit),
                Err(e) => {
                    self.buffer.release(job.id);
                    e.log();
                    tracing::warn!(error = %e, "Dispatch failed; cooling down");
                    tokio::time::sleep(self.cooldown).await;
                }
            }
        }

        tracing::info!(discarded = self.buffer.drain(), "Dispatcher stopped");
    }

    fn spawn(&self, job: Job, permit: ExecutorPermit) {
        let executor = self.executor.clone();
        let buffer = self.buffer.clone();
        let span = tracing::info_span!("job", job_id = %job.id, kind = %job.kind);
        JobMetrics::buffer_depth(buffer.len());

        self.tracker.spawn(
            async move {
                let job_id = job.id;
                executor.run(job, permit).await;
                buffer.release(job_id);
            }
            .instrument(span),
        );
    }
}
