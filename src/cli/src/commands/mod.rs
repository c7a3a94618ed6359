//! Subcommands of the `kiln` CLI.

pub mod dead_letters;
pub mod enqueue;
pub mod job;
pub mod maintenance;
pub mod stats;

use anyhow::{Context, Result};
use kiln_core::config::{Config, DatabaseConfig};
use kiln_core::db::Database;
use kiln_core::jobs::{JobKind, JobStore, PgJobStore, RetryPolicy};

/// Database pool plus the job store built on it.
pub struct Connection {
    db: Database,
    store: PgJobStore,
}

impl Connection {
    /// Connect using `--database-url` when given, otherwise the `database`
    /// section of the worker configuration.
    pub async fn open(config_path: Option<&str>, database_url: Option<&str>) -> Result<Self> {
        let (database, retry) = match database_url {
            Some(url) => {
                let mut database = DatabaseConfig::new(url);
                database.max_connections = 2;
                (database, RetryPolicy::default())
            }
            None => {
                let config =
                    Config::load(config_path).context("Failed to load configuration")?;
                (config.database, config.retry)
            }
        };

        let db = Database::new(&database)
            .await
            .context("Failed to connect to database")?;
        let store = db.job_store(retry);
        Ok(Self { db, store })
    }

    pub fn store(&self) -> &dyn JobStore {
        &self.store
    }

    pub async fn close(self) {
        self.db.pool().close().await;
    }
}

/// clap value parser for job kinds (case-insensitive).
pub fn parse_kind(s: &str) -> std::result::Result<JobKind, String> {
    s.parse::<JobKind>().map_err(|_| {
        let known: Vec<&str> = JobKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown job kind '{}', expected one of: {}", s, known.join(", "))
    })
}

/// clap value parser for humantime durations such as `15m` or `7days`.
pub fn parse_duration(s: &str) -> std::result::Result<std::time::Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}
