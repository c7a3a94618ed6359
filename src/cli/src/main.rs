//! Kiln CLI - operator tool for the Kiln job engine.
//!
//! Enqueues jobs, inspects and cancels them, lists dead letters and runs
//! store maintenance directly against PostgreSQL.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{dead_letters, enqueue, job, maintenance, stats, Connection};
use output::OutputFormat;

/// Kiln - durable background job engine CLI
#[derive(Parser)]
#[command(
    name = "kiln",
    version,
    about = "Kiln - durable background job engine",
    long_about = "Operator tool for enqueuing, inspecting and maintaining Kiln jobs.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file shared with kiln-worker
    #[arg(long, global = true, env = "KILN_CONFIG")]
    config: Option<String>,

    /// PostgreSQL URL; overrides the configuration file
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a job
    Enqueue(enqueue::EnqueueArgs),

    /// Show a job and its attempts
    Job(job::JobArgs),

    /// Cancel a queued job
    Cancel(job::JobArgs),

    /// List dead letters, newest first
    DeadLetters(dead_letters::DeadLettersArgs),

    /// Return stale running jobs to the queue
    Reap(maintenance::MaintenanceArgs),

    /// Delete finished jobs
    Purge(maintenance::MaintenanceArgs),

    /// Job counts per status
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let format = cli.output;
    let result = run(cli, format).await;

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli, format: OutputFormat) -> Result<()> {
    let conn = Connection::open(cli.config.as_deref(), cli.database_url.as_deref()).await?;
    let store = conn.store();

    let result = match cli.command {
        Commands::Enqueue(args) => enqueue::execute(args, store, format).await,
        Commands::Job(args) => job::show(args, store, format).await,
        Commands::Cancel(args) => job::cancel(args, store, format).await,
        Commands::DeadLetters(args) => dead_letters::execute(args, store, format).await,
        Commands::Reap(args) => maintenance::reap(args, store, format).await,
        Commands::Purge(args) => maintenance::purge(args, store, format).await,
        Commands::Stats => stats::execute(store, format).await,
    };

    conn.close().await;
    result
}
