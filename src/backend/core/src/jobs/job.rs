//! Job records and the types that travel with them.
//!
//! This module provides the persisted data model of the engine:
//!
//! - **Job**: a unit of deferred work with a kind, payload and retry budget
//! - **Attempt**: one execution try of a job
//! - **DeadLetter**: archive of a job that exhausted its budget
//! - **RetryPolicy**: backoff applied between failed attempts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{KilnError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier of an attempt row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct AttemptId(pub i64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Kind
// ═══════════════════════════════════════════════════════════════════════════════

/// Closed set of job kinds. Extend by adding a variant and registering a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_kind")]
pub enum JobKind {
    RuleExecutor,
    ClusterRebuilder,
    SearchIndexer,
    SyncCompactor,
    NotificationDispatcher,
    AnalyticsExporter,
    Generic,
}

impl JobKind {
    pub const ALL: [JobKind; 7] = [
        JobKind::RuleExecutor,
        JobKind::ClusterRebuilder,
        JobKind::SearchIndexer,
        JobKind::SyncCompactor,
        JobKind::NotificationDispatcher,
        JobKind::AnalyticsExporter,
        JobKind::Generic,
    ];

    /// Stored label of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleExecutor => "RuleExecutor",
            Self::ClusterRebuilder => "ClusterRebuilder",
            Self::SearchIndexer => "SearchIndexer",
            Self::SyncCompactor => "SyncCompactor",
            Self::NotificationDispatcher => "NotificationDispatcher",
            Self::AnalyticsExporter => "AnalyticsExporter",
            Self::Generic => "Generic",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        JobKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| KilnError::unknown_job_kind(s))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for `run_at` and a worker
    Queued,
    /// Claimed by a worker
    Running,
    /// Finished successfully
    Succeeded,
    /// Unsuccessful attempt with budget left
    Failed,
    /// Withdrawn before it ran
    Canceled,
    /// Retry budget exhausted
    Dead,
}

impl JobStatus {
    /// Terminal jobs never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Canceled | Self::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Higher runs first
    pub priority: i16,
    /// Earliest eligible execution time
    pub run_at: DateTime<Utc>,
    pub max_attempts: i16,
    /// Attempts finished so far
    pub attempt: i16,
    pub dedupe_key: Option<String>,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Attempts left before the job is dead-lettered.
    pub fn remaining_attempts(&self) -> i16 {
        (self.max_attempts - self.attempt).max(0)
    }

    /// Eligible for `fetch_queued` at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.run_at <= now
    }
}

/// Enqueue request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub kind: JobKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i16,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i16,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    /// Defaults to now
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

fn default_max_attempts() -> i16 {
    3
}

impl NewJob {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            priority: 0,
            max_attempts: default_max_attempts(),
            dedupe_key: None,
            run_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i16) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// Reject requests that could never satisfy `attempt <= max_attempts`.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(KilnError::validation(format!(
                "max_attempts must be at least 1, got {}",
                self.max_attempts
            )));
        }
        if matches!(&self.dedupe_key, Some(key) if key.trim().is_empty()) {
            return Err(KilnError::validation("dedupe_key must not be blank"));
        }
        Ok(())
    }
}

/// One execution try of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Attempt {
    pub id: AttemptId,
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error: Option<String>,
}

/// Archive of a job that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: i64,
    /// Nulled if the job row is later purged
    pub job_id: Option<JobId>,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub attempts: i16,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of reconciling an attempt into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    Succeeded,
    Retrying { attempt: i16, run_at: DateTime<Utc> },
    Dead { attempts: i16 },
}

impl CompletionOutcome {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Retrying { .. } => "retrying",
            Self::Dead { .. } => "dead",
        }
    }
}

/// Result of a stale-claim sweep. Each reclaimed job is charged the attempt
/// it was interrupted in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    /// Returned to `queued` with budget left
    pub requeued: u64,
    /// Budget exhausted; moved to `dead` with a dead letter
    pub dead: u64,
}

impl ReapReport {
    pub fn total(&self) -> u64 {
        self.requeued + self.dead
    }
}

/// Per-status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
    pub dead: u64,
    pub dead_letters: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay; the job is eligible again immediately
    Immediate,
    /// Fixed delay between retries
    Fixed { delay_secs: u64 },
    /// Linear increase in delay (initial + increment * attempt)
    Linear {
        initial_delay_secs: u64,
        increment_secs: u64,
    },
    /// Exponential increase in delay (initial * multiplier^attempt)
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_secs: 5,
            max_delay_secs: 3600,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Immediate => 0,
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Linear {
                initial_delay_secs,
                increment_secs,
            } => initial_delay_secs + (increment_secs * attempt as u64),
            Self::Exponential {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
            } => {
                let delay = (*initial_delay_secs as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_secs as f64) as u64
            }
        };

        Duration::from_secs(secs)
    }

    pub fn fixed(delay_secs: u64) -> Self {
        Self::Fixed { delay_secs }
    }

    pub fn exponential() -> Self {
        Self::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Decides where a failed attempt goes next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffStrategy) -> Self {
        Self { backoff }
    }

    /// Policy that requeues without delay.
    pub fn immediate() -> Self {
        Self::new(BackoffStrategy::Immediate)
    }

    /// Delay before the next attempt, given the attempt count *after*
    /// increment. `None` once the budget is spent.
    pub fn retry_delay(&self, attempt: i16, max_attempts: i16) -> Option<std::time::Duration> {
        if attempt >= max_attempts {
            return None;
        }
        let retry_index = attempt.saturating_sub(1).max(0) as u32;
        Some(self.backoff.delay_for_attempt(retry_index))
    }

    /// Outcome of a failed attempt, given the attempt count *after* increment.
    pub fn on_failure(&self, attempt: i16, max_attempts: i16, now: DateTime<Utc>) -> CompletionOutcome {
        let Some(delay) = self.retry_delay(attempt, max_attempts) else {
            return CompletionOutcome::Dead { attempts: attempt };
        };
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
        CompletionOutcome::Retrying {
            attempt,
            run_at: now + delay,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
