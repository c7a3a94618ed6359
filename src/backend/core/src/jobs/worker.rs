//! Job worker: wires the fetcher, dispatcher, executor pool and reaper together.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{
    Dispatcher, Executor, ExecutorPool, ExecutorPoolConfig, ExecutorPoolStats, Fetcher,
    HandlerRegistry, JobStore, PendingBuffer, Reaper,
};
use crate::error::{KilnError, Result};

/// Configuration for the job worker (`worker` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identifier written to `claimed_by`
    #[serde(default = "default_worker_name")]
    pub name: String,

    /// Maximum concurrent job executions
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Fetcher poll interval
    #[serde(default = "default_fetch_interval", with = "humantime_serde")]
    pub fetch_interval: Duration,

    /// Dispatcher wait when the buffer is empty
    #[serde(default = "default_dispatch_idle_interval", with = "humantime_serde")]
    pub dispatch_idle_interval: Duration,

    /// Dispatcher pause after a loop failure
    #[serde(default = "default_dispatch_cooldown", with = "humantime_serde")]
    pub dispatch_cooldown: Duration,

    /// Rows requested per fetch
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,

    /// Pending buffer capacity
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Claims older than this are considered abandoned
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,

    #[serde(default = "default_reap_interval", with = "humantime_serde")]
    pub reap_interval: Duration,

    /// How long shutdown waits for in-flight attempts
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            concurrency: default_concurrency(),
            fetch_interval: default_fetch_interval(),
            dispatch_idle_interval: default_dispatch_idle_interval(),
            dispatch_cooldown: default_dispatch_cooldown(),
            fetch_batch_size: default_fetch_batch_size(),
            buffer_capacity: default_buffer_capacity(),
            stale_after: default_stale_after(),
            reap_interval: default_reap_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl WorkerConfig {
    /// Reject settings the loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(KilnError::invalid_configuration("worker.name must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(KilnError::invalid_configuration("worker.concurrency must be at least 1"));
        }
        if self.buffer_capacity == 0 || self.fetch_batch_size == 0 {
            return Err(KilnError::invalid_configuration(
                "worker.buffer_capacity and worker.fetch_batch_size must be at least 1",
            ));
        }

        let periods = [
            ("fetch_interval", self.fetch_interval),
            ("dispatch_idle_interval", self.dispatch_idle_interval),
            ("dispatch_cooldown", self.dispatch_cooldown),
            ("stale_after", self.stale_after),
            ("reap_interval", self.reap_interval),
        ];
        if let Some((field, _)) = periods.iter().find(|(_, period)| period.is_zero()) {
            return Err(KilnError::invalid_configuration(format!(
                "worker.{} must be greater than zero",
                field
            )));
        }
        Ok(())
    }
}

fn default_worker_name() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("kiln-worker-{}", &suffix[..8])
}

fn default_concurrency() -> usize {
    8
}

fn default_fetch_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_dispatch_idle_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_dispatch_cooldown() -> Duration {
    Duration::from_millis(500)
}

fn default_fetch_batch_size() -> usize {
    100
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_stale_after() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_reap_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Point-in-time view of a running worker.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub worker_id: String,
    /// Jobs waiting in the pending buffer
    pub buffered: usize,
    /// Execution tasks alive
    pub in_flight: usize,
    pub pool: ExecutorPoolStats,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    worker_id: String,
    shutdown: CancellationToken,
    loops: TaskTracker,
    executions: TaskTracker,
    pool: Arc<ExecutorPool>,
    buffer: Arc<PendingBuffer>,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    /// Signal every loop and handler to stop. Does not wait.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            worker_id: self.worker_id.clone(),
            buffered: self.buffer.len(),
            in_flight: self.executions.len(),
            pool: self.pool.stats(),
        }
    }

    /// Shut down and wait for the loops, then for in-flight attempts up to the
    /// shutdown timeout. Returns true when every attempt finished in time;
    /// anything left `running` is reclaimed later by the reaper.
    pub async fn join(self) -> bool {
        self.shutdown.cancel();

        self.loops.close();
        self.loops.wait().await;

        self.pool.close();
        self.executions.close();
        let in_flight = self.executions.len();
        if in_flight > 0 {
            tracing::info!(
                worker = %self.worker_id,
                in_flight,
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Waiting for in-flight jobs"
            );
        }

        let drained = tokio::time::timeout(self.shutdown_timeout, self.executions.wait())
            .await
            .is_ok();
        if drained {
            tracing::info!(worker = %self.worker_id, "Worker stopped");
        } else {
            tracing::warn!(
                worker = %self.worker_id,
                remaining = self.executions.len(),
                "Shutdown timeout elapsed; unfinished jobs will be reclaimed by the reaper"
            );
        }
        drained
    }
}

/// Job worker that processes jobs from a store.
pub struct JobWorker {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
}

impl JobWorker {
    pub fn new(config: WorkerConfig, store: Arc<dyn JobStore>, registry: HandlerRegistry) -> Self {
        Self {
            config,
            store,
            registry: Arc::new(registry),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Sweep stale claims once, then spawn the loops and return a handle.
    pub async fn start(self) -> WorkerHandle {
        let config = self.config;
        let shutdown = CancellationToken::new();
        let loops = TaskTracker::new();
        let executions = TaskTracker::new();

        if let Err(e) = config.validate() {
            e.log();
            tracing::warn!(worker = %config.name, error = %e, "Worker config failed validation; clamping loop intervals");
        }
        if self.registry.is_empty() {
            tracing::warn!(worker = %config.name, "No handlers registered; every job will fail");
        }

        let reaper = Reaper::new(self.store.clone(), config.stale_after, config.reap_interval);
        if let Err(e) = reaper.reap_once().await {
            e.log();
        }

        let buffer = Arc::new(PendingBuffer::new(config.buffer_capacity));
        let pool = Arc::new(ExecutorPool::new(
            ExecutorPoolConfig::with_concurrency(config.concurrency).with_name(config.name.clone()),
        ));
        let executor = Arc::new(Executor::new(
            self.store.clone(),
            self.registry.clone(),
            config.name.as_str(),
            shutdown.clone(),
        ));

        let fetcher = Fetcher::new(
            self.store.clone(),
            buffer.clone(),
            config.fetch_batch_size,
            config.fetch_interval,
        );
        let dispatcher = Dispatcher::new(buffer.clone(), pool.clone(), executor, executions.clone())
            .with_intervals(config.dispatch_idle_interval, config.dispatch_cooldown);

        loops.spawn(fetcher.run(shutdown.clone()));
        loops.spawn(dispatcher.run(shutdown.clone()));
        loops.spawn(reaper.run(shutdown.clone()));

        tracing::info!(
            worker = %config.name,
            concurrency = pool.max_concurrency(),
            kinds = ?self.registry.kinds(),
            "Job worker started"
        );

        WorkerHandle {
            worker_id: config.name,
            shutdown,
            loops,
            executions,
            pool,
            buffer,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}
