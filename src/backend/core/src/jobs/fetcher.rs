//! Fetcher: polls the store for due jobs and feeds the pending buffer.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{JobStore, PendingBuffer, PushOutcome, MIN_LOOP_INTERVAL};
use crate::error::Result;
use crate::telemetry::JobMetrics;

/// Counts from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Rows returned by the store
    pub fetched: usize,
    /// Newly buffered
    pub queued: usize,
    /// Already buffered or executing locally
    pub duplicates: usize,
    /// Left in the store because the buffer was full
    pub dropped: usize,
}

pub struct Fetcher {
    store: Arc<dyn JobStore>,
    buffer: Arc<PendingBuffer>,
    batch_size: usize,
    interval: Duration,
}

impl Fetcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        buffer: Arc<PendingBuffer>,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            buffer,
            batch_size: batch_size.max(1),
            interval: interval.max(MIN_LOOP_INTERVAL),
        }
    }

    /// One poll cycle. Never blocks on the dispatcher.
    pub async fn poll_once(&self) -> Result<FetchReport> {
        let jobs = self.store.fetch_queued(self.batch_size).await?;
        let mut report = FetchReport {
            fetched: jobs.len(),
            ..Default::default()
        };

        for (index, job) in jobs.into_iter().enumerate() {
            match self.buffer.push(job) {
                PushOutcome::Queued => report.queued += 1,
                PushOutcome::Duplicate => report.duplicates += 1,
                PushOutcome::Full => {
                    report.dropped = report.fetched - index;
                    break;
                }
            }
        }

        JobMetrics::fetched(report.queued);
        JobMetrics::buffer_depth(self.buffer.len());

        if report.dropped > 0 {
            tracing::warn!(
                dropped = report.dropped,
                capacity = self.buffer.capacity(),
                "Pending buffer full; remaining jobs left for the next cycle"
            );
        } else if report.queued > 0 {
            tracing::debug!(queued = report.queued, duplicates = report.duplicates, "Fetched jobs");
        }

        Ok(report)
    }

    /// Poll until `shutdown` fires. Store errors are logged and retried on the
    /// next tick.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.batch_size,
            "Fetcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        e.log();
                        tracing::warn!(error = %e, "Fetch cycle failed");
                    }
                }
            }
        }

        tracing::info!("Fetcher stopped");
    }
}
