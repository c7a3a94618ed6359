//! `kiln dead-letters`

use anyhow::Result;
use clap::Args;
use kiln_core::jobs::{DeadLetter, JobKind, JobStore};
use tabled::Tabled;

use super::parse_kind;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct DeadLettersArgs {
    /// Only letters of this kind
    #[arg(short, long, value_parser = parse_kind)]
    kind: Option<JobKind>,

    /// Maximum number of results
    #[arg(short, long, default_value = "50")]
    limit: usize,
}

#[derive(Tabled)]
struct DeadLetterRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Job")]
    job_id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Attempts")]
    attempts: i16,
    #[tabled(rename = "Last error")]
    last_error: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&DeadLetter> for DeadLetterRow {
    fn from(letter: &DeadLetter) -> Self {
        Self {
            id: letter.id,
            job_id: letter
                .job_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "(purged)".into()),
            kind: letter.kind.to_string(),
            attempts: letter.attempts,
            last_error: output::truncate(letter.last_error.as_deref().unwrap_or("-"), 60),
            created_at: letter.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

pub async fn execute(args: DeadLettersArgs, store: &dyn JobStore, format: OutputFormat) -> Result<()> {
    let letters = store.dead_letters(args.kind, args.limit).await?;
    output::print_list(&letters, format, |letter| DeadLetterRow::from(letter))
}
