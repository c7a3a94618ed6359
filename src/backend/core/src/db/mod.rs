//! Database layer for Kiln.
//!
//! Uses PostgreSQL for persistent storage with sqlx. Job queries live in
//! [`PgJobStore`]; this module owns the pool and the schema.

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::jobs::{PgJobStore, RetryPolicy};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await?;

        tracing::debug!(
            max_connections = config.max_connections,
            "Database pool connected"
        );
        Ok(Self { pool })
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Job store sharing this pool.
    pub fn job_store(&self, retry_policy: RetryPolicy) -> PgJobStore {
        PgJobStore::new(self.pool.clone(), retry_policy)
    }
}
