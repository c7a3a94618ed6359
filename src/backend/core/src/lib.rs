#![allow(clippy::result_large_err)]
//! # Kiln Core
//!
//! Durable background job engine backed by PostgreSQL.
//!
//! ## Architecture
//!
//! - **Jobs**: job model, retry policy, store trait with Postgres and in-memory backends
//! - **Worker**: fetcher, pending buffer, dispatcher, bounded executor pool and reaper
//! - **Handlers**: per-kind registry of async handlers with timeout and panic capture
//! - **Telemetry**: structured logging and Prometheus metrics
//! - **Config**: layered file and environment configuration

pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorSeverity, KilnError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, DatabaseConfig};
    pub use crate::db::Database;
    pub use crate::error::{ErrorCode, ErrorSeverity, KilnError, Result};
    pub use crate::jobs::{
        BackoffStrategy, CompletionOutcome, DeadLetter, HandlerRegistry, InMemoryJobStore, Job,
        JobContext, JobError, JobHandler, JobId, JobKind, JobResult, JobStatus, JobStore,
        JobWorker, NewJob, PgJobStore, QueueStats, RetryPolicy, WorkerConfig, WorkerHandle,
    };
    pub use crate::telemetry::{init_telemetry, ObservabilityConfig};
}
