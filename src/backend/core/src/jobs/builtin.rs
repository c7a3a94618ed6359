//! Built-in handlers.
//!
//! Business logic for most kinds lives in the services that own the data; the
//! worker binary stands in for them with [`LoggingHandler`]. `Generic` jobs
//! carry store maintenance tasks handled by [`MaintenanceHandler`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{HandlerRegistry, JobContext, JobError, JobHandler, JobKind, JobResult, JobStore};

/// Acknowledges jobs of one kind by logging them.
#[derive(Debug, Clone, Copy)]
pub struct LoggingHandler {
    kind: JobKind,
}

impl LoggingHandler {
    pub fn new(kind: JobKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl JobHandler for LoggingHandler {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn handle(&self, ctx: &JobContext) -> JobResult {
        if !ctx.payload().is_object() {
            return Err(JobError::new("payload must be a JSON object").with_code("BadPayload"));
        }
        ctx.log_info(&format!(
            "Acknowledged {} job with {} payload fields",
            ctx.kind(),
            ctx.payload().as_object().map_or(0, |m| m.len())
        ));
        Ok(())
    }
}

/// Payload of a `Generic` maintenance job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum MaintenanceTask {
    /// Delete terminal jobs older than the threshold
    PurgeFinished {
        #[serde(with = "humantime_serde")]
        older_than: Duration,
    },
    /// Return stale running jobs to the queue
    ReapStale {
        #[serde(with = "humantime_serde")]
        older_than: Duration,
    },
}

/// Runs [`MaintenanceTask`]s against the store.
pub struct MaintenanceHandler {
    store: Arc<dyn JobStore>,
}

impl MaintenanceHandler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for MaintenanceHandler {
    fn kind(&self) -> JobKind {
        JobKind::Generic
    }

    async fn handle(&self, ctx: &JobContext) -> JobResult {
        let task: MaintenanceTask = ctx.payload_as()?;
        match task {
            MaintenanceTask::PurgeFinished { older_than } => {
                let purged = self.store.purge_finished(older_than).await?;
                ctx.log_info(&format!("Purged {} finished jobs", purged));
            }
            MaintenanceTask::ReapStale { older_than } => {
                let report = self.store.reap_stale(older_than, Some(ctx.job_id())).await?;
                ctx.log_info(&format!(
                    "Reaped {} stale jobs ({} dead-lettered)",
                    report.total(),
                    report.dead
                ));
            }
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(600))
    }
}

/// Registry used by `kiln-worker`: maintenance for `Generic`, logging for the rest.
pub fn builtin_registry(store: Arc<dyn JobStore>) -> HandlerRegistry {
    JobKind::ALL
        .iter()
        .copied()
        .filter(|kind| *kind != JobKind::Generic)
        .fold(HandlerRegistry::new(), |registry, kind| {
            registry.register(LoggingHandler::new(kind))
        })
        .register(MaintenanceHandler::new(store))
}
