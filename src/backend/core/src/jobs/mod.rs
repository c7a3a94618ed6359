//! Durable background job engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   fetch_queued   ┌─────────┐  push  ┌────────────────┐  pop  ┌────────────┐
//! │ JobStore │ ───────────────▶ │ Fetcher │ ─────▶ │ PendingBuffer  │ ────▶ │ Dispatcher │
//! └──────────┘                  └─────────┘        └────────────────┘       └────────────┘
//!      ▲                                                                          │ permit
//!      │  mark_running / attempts / complete (+ dead letter)                      ▼
//!      └──────────────────────────────────────────────────────────────────┌──────────────┐
//!                                                                         │ Executor     │
//!                                                                         │ (per job)    │
//!                                                                         └──────────────┘
//! ```
//!
//! The store is the only source of truth. `mark_running` is a conditional
//! update, so any number of workers may poll the same table; the pending
//! buffer only avoids handing the same row to two local tasks.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kiln_core::jobs::{HandlerRegistry, InMemoryJobStore, JobKind, JobWorker, NewJob, WorkerConfig};
//!
//! let store = Arc::new(InMemoryJobStore::default());
//! store.enqueue(NewJob::new(JobKind::SearchIndexer, json!({"doc": 42}))).await?;
//!
//! let registry = HandlerRegistry::new()
//!     .register_fn(JobKind::SearchIndexer, |ctx| async move {
//!         ctx.log_info("indexing");
//!         Ok(())
//!     });
//!
//! let handle = JobWorker::new(WorkerConfig::default(), store, registry).start().await;
//! // ...
//! handle.join().await;
//! ```

pub mod buffer;
pub mod builtin;
pub mod dispatcher;
pub mod executor;
pub mod fetcher;
pub mod job;
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod reaper;
pub mod registry;
pub mod store;
pub mod worker;

pub use buffer::{PendingBuffer, PushOutcome};
pub use builtin::{builtin_registry, LoggingHandler, MaintenanceHandler, MaintenanceTask};
pub use dispatcher::Dispatcher;
pub use executor::{ExecutionOutcome, Executor};
pub use fetcher::{FetchReport, Fetcher};
pub use job::{
    Attempt, AttemptId, BackoffStrategy, CompletionOutcome, DeadLetter, Job, JobId, JobKind,
    JobStatus, NewJob, QueueStats, ReapReport, RetryPolicy,
};
pub use memory::InMemoryJobStore;
pub use pool::{ExecutorPermit, ExecutorPool, ExecutorPoolConfig, ExecutorPoolStats};
pub use postgres::PgJobStore;
pub use reaper::Reaper;
pub use registry::{FnHandler, HandlerRegistry, JobContext, JobError, JobHandler, JobResult};
pub use store::JobStore;
pub use worker::{JobWorker, WorkerConfig, WorkerHandle, WorkerStats};

/// Shortest period any worker loop ticks or idles at.
pub(crate) const MIN_LOOP_INTERVAL: std::time::Duration = std::time::Duration::from_millis(1);
