//! Error handling for Kiln Core.
//!
//! This module provides:
//! - A single crate error type with a machine-readable code and error chaining
//! - Severity classification per code
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use kiln_core::error::{ErrorCode, KilnError, Result};
//!
//! async fn show(store: &dyn JobStore, id: JobId) -> Result<Job> {
//!     store
//!         .get_job(id)
//!         .await?
//!         .ok_or_else(|| KilnError::job_not_found(id.as_uuid()))
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job lifecycle (1000-1099)
    DuplicateJob,
    ClaimLost,
    JobNotFound,
    InvalidStateTransition,

    // Handler (1100-1199)
    HandlerFailed,
    HandlerPanicked,
    HandlerTimeout,

    // Database (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    RecordNotFound,

    // Serialization (2200-2299)
    SerializationError,
    DeserializationError,

    // Validation (4100-4199)
    ValidationError,

    // Configuration (5000-5099)
    ConfigurationError,
    UnknownJobKind,
    InvalidConfiguration,

    // Internal (9000-9099)
    InternalError,
    ShuttingDown,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::DuplicateJob => 1000,
            Self::ClaimLost => 1001,
            Self::JobNotFound => 1002,
            Self::InvalidStateTransition => 1003,

            Self::HandlerFailed => 1100,
            Self::HandlerPanicked => 1101,
            Self::HandlerTimeout => 1102,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::RecordNotFound => 2003,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ValidationError => 4100,

            Self::ConfigurationError => 5000,
            Self::UnknownJobKind => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::ShuttingDown => 9001,
        }
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "handler",
            2000..=2099 => "database",
            2200..=2299 => "serialization",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected outcomes of normal operation (lost claims, dedupe conflicts)
    Low,
    /// Job-level failures that the retry machinery absorbs
    Medium,
    /// Store and configuration failures
    High,
    /// The worker cannot make progress
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::DuplicateJob
            | ErrorCode::ClaimLost
            | ErrorCode::JobNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::InvalidStateTransition
            | ErrorCode::ValidationError
            | ErrorCode::ShuttingDown => Self::Low,

            ErrorCode::HandlerFailed
            | ErrorCode::HandlerPanicked
            | ErrorCode::HandlerTimeout => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::UnknownJobKind
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::DatabaseConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Kiln Core.
#[derive(Error, Debug)]
pub struct KilnError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Short human-readable message
    message: Cow<'static, str>,

    /// Detailed message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for KilnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " ({})", internal)?;
        }
        Ok(())
    }
}

impl KilnError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both a short and a detailed message.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    /// A setting is present but has an unusable value.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// True for a dedupe-key collision on enqueue.
    pub fn is_conflict(&self) -> bool {
        self.code == ErrorCode::DuplicateJob
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "kiln_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for KilnError {
    fn from(error: sqlx::Error) -> Self {
        let (code, msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::RecordNotFound, "The requested record was not found"),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                return Self::with_internal(
                    ErrorCode::DuplicateJob,
                    "A non-terminal job with this dedupe key already exists",
                    db_err.constraint().unwrap_or("unique").to_string(),
                )
                .with_source(error);
            }
            sqlx::Error::Database(_) => (ErrorCode::DatabaseQueryFailed, "A database error occurred"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => (
                ErrorCode::DeserializationError,
                "Failed to decode a stored row",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for KilnError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::DatabaseError,
            "Failed to apply database migrations",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<tokio::sync::AcquireError> for KilnError {
    fn from(error: tokio::sync::AcquireError) -> Self {
        Self::with_internal(ErrorCode::ShuttingDown, "Executor pool is closed", error.to_string())
            .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for KilnError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::HandlerTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for KilnError {
    fn from(error: config::ConfigError) -> Self {
        let (code, msg) = match &error {
            config::ConfigError::NotFound(_) => {
                (ErrorCode::ConfigurationError, "Required configuration not found")
            }
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                (ErrorCode::InvalidConfiguration, "Configuration file is invalid")
            }
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl KilnError {
    /// Dedupe key already held by a queued or running job.
    pub fn duplicate_job(dedupe_key: &str) -> Self {
        Self::with_internal(
            ErrorCode::DuplicateJob,
            "A non-terminal job with this dedupe key already exists",
            format!("dedupe_key={}", dedupe_key),
        )
    }

    /// Another worker claimed the job first.
    pub fn claim_lost(job_id: uuid::Uuid) -> Self {
        Self::new(ErrorCode::ClaimLost, format!("Job {} was claimed by another worker", job_id))
    }

    pub fn job_not_found(job_id: uuid::Uuid) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
    }

    /// The job's current status does not allow the requested transition.
    pub fn invalid_state_transition(
        job_id: uuid::Uuid,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::with_internal(
            ErrorCode::InvalidStateTransition,
            format!("Job {} cannot move from {} to {}", job_id, from, to),
            format!("job_id={}", job_id),
        )
    }

    /// No handler is registered for the job's kind.
    pub fn unknown_job_kind(kind: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::UnknownJobKind,
            format!("No handler registered for job kind {}", kind),
        )
    }

    pub fn handler_failed(kind: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::HandlerFailed,
            format!("Handler for {} failed", kind),
            reason,
        )
    }

    pub fn handler_panicked(kind: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::HandlerPanicked,
            format!("Handler for {} panicked", kind),
            reason,
        )
    }

    pub fn handler_timeout(kind: impl fmt::Display, timeout: std::time::Duration) -> Self {
        Self::new(
            ErrorCode::HandlerTimeout,
            format!("Handler for {} timed out after {}ms", kind, timeout.as_millis()),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
