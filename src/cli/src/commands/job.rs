//! `kiln job` and `kiln cancel`

use anyhow::Result;
use clap::Args;
use kiln_core::error::KilnError;
use kiln_core::jobs::{Attempt, Job, JobId, JobStatus, JobStore};
use serde::Serialize;
use tabled::Tabled;
use uuid::Uuid;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct JobArgs {
    /// Job ID
    id: Uuid,
}

#[derive(Serialize)]
struct JobDetail {
    job: Job,
    attempts: Vec<Attempt>,
}

#[derive(Tabled)]
struct AttemptRow {
    #[tabled(rename = "#")]
    number: usize,
    #[tabled(rename = "Started")]
    started_at: String,
    #[tabled(rename = "Finished")]
    finished_at: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl AttemptRow {
    fn new(number: usize, attempt: &Attempt) -> Self {
        let result = match attempt.success {
            Some(true) => "ok",
            Some(false) => "failed",
            None => "open",
        };
        Self {
            number,
            started_at: attempt.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            finished_at: attempt
                .finished_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".into()),
            result: result.to_string(),
            error: output::truncate(attempt.error.as_deref().unwrap_or("-"), 60),
        }
    }
}

async fn find_job(store: &dyn JobStore, id: JobId) -> kiln_core::Result<Job> {
    store
        .get_job(id)
        .await?
        .ok_or_else(|| KilnError::job_not_found(id.as_uuid()))
}

pub async fn show(args: JobArgs, store: &dyn JobStore, format: OutputFormat) -> Result<()> {
    let id = JobId::from(args.id);
    let job = find_job(store, id).await?;
    let attempts = store.attempts_for(id).await?;

    if format != OutputFormat::Table {
        return output::print_item(&JobDetail { job, attempts }, format);
    }

    output::print_header(&format!("Job {}", job.id));
    output::print_detail("Kind", job.kind.as_str());
    output::print_detail("Status", &output::status_label(job.status.as_str()));
    output::print_detail("Priority", &job.priority.to_string());
    output::print_detail("Attempts", &format!("{}/{}", job.attempt, job.max_attempts));
    output::print_detail("Run at", &job.run_at.to_rfc3339());
    if let Some(key) = &job.dedupe_key {
        output::print_detail("Dedupe key", key);
    }
    if let Some(worker) = &job.claimed_by {
        output::print_detail("Claimed by", worker);
    }
    if let Some(error) = &job.last_error {
        output::print_detail("Last error", error);
    }
    output::print_detail("Payload", &job.payload.to_string());

    let rows: Vec<AttemptRow> = attempts
        .iter()
        .enumerate()
        .map(|(i, a)| AttemptRow::new(i + 1, a))
        .collect();
    if let Some(table) = output::render_table(&rows) {
        println!();
        println!("{}", table);
    }
    Ok(())
}

pub async fn cancel(args: JobArgs, store: &dyn JobStore, format: OutputFormat) -> Result<()> {
    let id = JobId::from(args.id);

    if store.cancel(id).await? {
        match format {
            OutputFormat::Table => output::print_success(&format!("Job {} canceled", id)),
            _ => output::print_item(&serde_json::json!({"id": id, "canceled": true}), format)?,
        }
        return Ok(());
    }

    let job = find_job(store, id).await?;
    Err(KilnError::invalid_state_transition(
        id.as_uuid(),
        job.status.as_str(),
        JobStatus::Canceled.as_str(),
    )
    .into())
}
