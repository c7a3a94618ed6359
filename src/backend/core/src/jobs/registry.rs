//! Handler registry: the static `JobKind -> handler` table built at start-up.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Job, JobId, JobKind};
use crate::error::{KilnError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    /// Optional machine-readable code
    pub code: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<KilnError> for JobError {
    fn from(error: KilnError) -> Self {
        let message = match error.internal_message() {
            Some(detail) => format!("{}: {}", error.message(), detail),
            None => error.message().to_string(),
        };
        Self {
            message,
            code: Some(error.code().to_string()),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(error: serde_json::Error) -> Self {
        KilnError::from(error).into()
    }
}

/// Result type for handler execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// What a handler sees of the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
    worker_id: Arc<str>,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(job: Job, worker_id: impl Into<Arc<str>>, cancellation: CancellationToken) -> Self {
        Self {
            job,
            worker_id: worker_id.into(),
            cancellation,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn kind(&self) -> JobKind {
        self.job.kind
    }

    /// 1-indexed number of the attempt in progress.
    pub fn attempt(&self) -> i16 {
        self.job.attempt + 1
    }

    pub fn max_attempts(&self) -> i16 {
        self.job.max_attempts
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Deserialize the payload into a handler-specific type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> std::result::Result<T, JobError> {
        serde_json::from_value(self.job.payload.clone()).map_err(|e| {
            JobError::new(format!("invalid {} payload: {}", self.job.kind, e)).with_code("BadPayload")
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// True once the worker is shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Run `future` unless shutdown wins first.
    pub async fn cancellable<F, T>(&self, future: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            result = future => Some(result),
            _ = self.cancellation.cancelled() => None,
        }
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job.id,
            kind = %self.job.kind,
            attempt = self.attempt(),
            message
        );
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job.id,
            kind = %self.job.kind,
            attempt = self.attempt(),
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Business logic for one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Execute one attempt. Must be safe to run more than once for the same job.
    async fn handle(&self, ctx: &JobContext) -> JobResult;

    /// Upper bound on a single attempt. `None` runs unbounded.
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(300))
    }
}

/// Adapter turning an async closure into a handler.
pub struct FnHandler<F> {
    kind: JobKind,
    timeout: Option<Duration>,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    pub fn new(kind: JobKind, f: F) -> Self {
        Self {
            kind,
            timeout: Some(Duration::from_secs(300)),
            f,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn handle(&self, ctx: &JobContext) -> JobResult {
        (self.f)(ctx.clone()).await
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable once the worker starts.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own kind, replacing any previous one.
    pub fn register<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.insert(Arc::new(handler));
        self
    }

    pub fn register_fn<F, Fut>(self, kind: JobKind, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.register(FnHandler::new(kind, f))
    }

    pub fn insert(&mut self, handler: Arc<dyn JobHandler>) {
        let kind = handler.kind();
        if self.handlers.insert(kind, handler).is_some() {
            tracing::warn!(kind = %kind, "Replacing previously registered handler");
        }
    }

    /// Handler for `kind`, or a configuration error when none is registered.
    pub fn get(&self, kind: JobKind) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| KilnError::unknown_job_kind(kind))
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .iter()
            .copied()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
