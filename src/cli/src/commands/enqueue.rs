//! `kiln enqueue`

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use kiln_core::jobs::{JobKind, JobStore, NewJob};
use serde::Serialize;
use std::time::Duration;

use super::{parse_duration, parse_kind};
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct EnqueueArgs {
    /// Job kind, e.g. SearchIndexer
    #[arg(short, long, value_parser = parse_kind)]
    kind: JobKind,

    /// JSON payload
    #[arg(short, long, default_value = "{}")]
    payload: String,

    /// Higher runs first
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    priority: i16,

    #[arg(long, default_value = "3")]
    max_attempts: i16,

    /// Reject the job while another active job holds this key
    #[arg(long)]
    dedupe_key: Option<String>,

    /// Defer the first run, e.g. 30s or 2h
    #[arg(long, value_parser = parse_duration)]
    delay: Option<Duration>,
}

#[derive(Serialize)]
struct Enqueued {
    id: String,
    kind: JobKind,
    run_at: String,
}

impl EnqueueArgs {
    fn into_new_job(self) -> Result<NewJob> {
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).context("--payload is not valid JSON")?;

        let mut job = NewJob::new(self.kind, payload)
            .with_priority(self.priority)
            .with_max_attempts(self.max_attempts);
        if let Some(key) = self.dedupe_key {
            job = job.with_dedupe_key(key);
        }
        if let Some(delay) = self.delay {
            let delay = chrono::Duration::from_std(delay).context("--delay is out of range")?;
            job = job.run_at(Utc::now() + delay);
        }
        Ok(job)
    }
}

pub async fn execute(args: EnqueueArgs, store: &dyn JobStore, format: OutputFormat) -> Result<()> {
    let job = args.into_new_job()?;
    let kind = job.kind;
    let run_at = job.run_at.unwrap_or_else(Utc::now);

    let id = store.enqueue(job).await?;

    let enqueued = Enqueued {
        id: id.to_string(),
        kind,
        run_at: run_at.to_rfc3339(),
    };
    match format {
        OutputFormat::Table => {
            output::print_success("Job enqueued");
            output::print_detail("ID", &enqueued.id);
            output::print_detail("Kind", kind.as_str());
            output::print_detail("Run at", &enqueued.run_at);
        }
        _ => output::print_item(&enqueued, format)?,
    }
    Ok(())
}
