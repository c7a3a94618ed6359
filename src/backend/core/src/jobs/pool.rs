//! Executor pool: bounds concurrent job executions with a tokio Semaphore.
//!
//! The Dispatcher acquires a permit before spawning each execution task; the
//! permit travels into the task and is released when the attempt finishes.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Result;

/// Configuration for the executor pool.
#[derive(Debug, Clone)]
pub struct ExecutorPoolConfig {
    /// Maximum number of concurrent executions
    pub max_concurrency: usize,
    /// Name for this pool (for logging)
    pub name: String,
}

impl Default for ExecutorPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            name: "executor".to_string(),
        }
    }
}

impl ExecutorPoolConfig {
    pub fn with_concurrency(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// A handle to an execution slot that releases when dropped.
pub struct ExecutorPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
    started_at: Instant,
    finished: bool,
}

impl ExecutorPermit {
    pub fn mark_success(mut self) {
        self.finish(true);
    }

    pub fn mark_failure(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, success: bool) {
        self.finished = true;
        if success {
            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.record_duration(self.started_at.elapsed());
        self.stats.current.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for ExecutorPermit {
    fn drop(&mut self) {
        // Claim lost or task aborted before an outcome was recorded
        if !self.finished {
            self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
            self.stats.current.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
struct PoolStats {
    acquired: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    total_exec_time_us: AtomicU64,
    peak: AtomicUsize,
    current: AtomicUsize,
}

impl PoolStats {
    fn record_acquire(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let current = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(current, Ordering::Relaxed);
    }

    fn record_duration(&self, duration: Duration) {
        self.total_exec_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }
}

/// Fixed-size pool of execution slots.
pub struct ExecutorPool {
    config: ExecutorPoolConfig,
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
}

impl ExecutorPool {
    pub fn new(config: ExecutorPoolConfig) -> Self {
        let max = config.max_concurrency.max(1);
        tracing::info!(pool_name = %config.name, max_concurrency = max, "Executor pool created");

        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            config: ExecutorPoolConfig {
                max_concurrency: max,
                ..config
            },
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Executions currently holding a permit.
    pub fn active(&self) -> usize {
        self.config.max_concurrency - self.semaphore.available_permits()
    }

    /// Wait for a free slot. Fails only once the pool is closed.
    pub async fn acquire(&self) -> Result<ExecutorPermit> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        Ok(self.wrap(permit))
    }

    pub fn try_acquire(&self) -> Option<ExecutorPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.wrap(permit))
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> ExecutorPermit {
        self.stats.record_acquire();
        tracing::trace!(
            pool_name = %self.config.name,
            available = self.semaphore.available_permits(),
            "Executor permit acquired"
        );
        ExecutorPermit {
            _permit: permit,
            stats: self.stats.clone(),
            started_at: Instant::now(),
            finished: false,
        }
    }

    /// Reject further acquisitions. Outstanding permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn stats(&self) -> ExecutorPoolStats {
        let stats = &self.stats;
        let succeeded = stats.succeeded.load(Ordering::Relaxed);
        let failed = stats.failed.load(Ordering::Relaxed);
        let completed = succeeded + failed;

        ExecutorPoolStats {
            name: self.config.name.clone(),
            max_concurrency: self.config.max_concurrency,
            active: self.active(),
            acquired: stats.acquired.load(Ordering::Relaxed),
            succeeded,
            failed,
            abandoned: stats.abandoned.load(Ordering::Relaxed),
            peak_concurrent: stats.peak.load(Ordering::Relaxed),
            avg_exec_time_us: if completed > 0 {
                stats.total_exec_time_us.load(Ordering::Relaxed) / completed
            } else {
                0
            },
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone)]
pub struct ExecutorPoolStats {
    pub name: String,
    pub max_concurrency: usize,
    pub active: usize,
    pub acquired: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Permits dropped without an outcome (lost claims)
    pub abandoned: u64,
    pub peak_concurrent: usize,
    pub avg_exec_time_us: u64,
}

impl ExecutorPoolStats {
    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.succeeded + self.failed;
        if total == 0 {
            100.0
        } else {
            (self.succeeded as f64 / total as f64) * 100.0
        }
    }
}
