//! Kiln worker - main entry point
//!
//! Polls the jobs table and runs the built-in handlers until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use kiln_core::{
    config::Config,
    db::Database,
    jobs::{builtin_registry, JobStore, JobWorker},
    telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "kiln-worker", version, about = "Kiln background job worker")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "KILN_CONFIG")]
    config: Option<String>,

    /// Apply database migrations before starting
    #[arg(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    telemetry::init_telemetry(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker = %config.worker.name,
        "Starting Kiln worker"
    );

    let db = Database::new(&config.database)
        .await
        .context("Failed to connect to database")?;
    if args.migrate {
        db.migrate().await?;
    }

    let store: Arc<dyn JobStore> = Arc::new(db.job_store(config.retry.clone()));
    let registry = builtin_registry(store.clone());

    let handle = JobWorker::new(config.worker.clone(), store, registry).start().await;

    shutdown_signal().await;

    if !handle.join().await {
        tracing::warn!("Worker exited with attempts still running");
    }
    db.pool().close().await;
    tracing::info!("Worker shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
