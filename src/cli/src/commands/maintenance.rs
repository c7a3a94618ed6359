//! `kiln reap` and `kiln purge`

use anyhow::Result;
use clap::Args;
use kiln_core::jobs::JobStore;
use std::time::Duration;

use super::parse_duration;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct MaintenanceArgs {
    /// Age threshold, e.g. 15m or 7days
    #[arg(long, value_parser = parse_duration)]
    older_than: Option<Duration>,
}

const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15 * 60);
const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

pub async fn reap(args: MaintenanceArgs, store: &dyn JobStore, format: OutputFormat) -> Result<()> {
    let older_than = args.older_than.unwrap_or(DEFAULT_STALE_AFTER);
    let reaped = store.reap_stale(older_than, None).await?;
    report("reaped", reaped.total(), older_than, format)?;
    if reaped.dead > 0 && format == OutputFormat::Table {
        output::print_warning(&format!(
            "{} of them ran out of attempts and were dead-lettered",
            reaped.dead
        ));
    }
    Ok(())
}

pub async fn purge(args: MaintenanceArgs, store: &dyn JobStore, format: OutputFormat) -> Result<()> {
    let older_than = args.older_than.unwrap_or(DEFAULT_RETENTION);
    let purged = store.purge_finished(older_than).await?;
    report("purged", purged, older_than, format)
}

fn report(action: &str, count: u64, older_than: Duration, format: OutputFormat) -> Result<()> {
    let threshold = humantime::format_duration(older_than).to_string();
    match format {
        OutputFormat::Table if count == 0 => {
            output::print_info(&format!("Nothing {} (older than {})", action, threshold));
        }
        OutputFormat::Table => {
            output::print_success(&format!(
                "{} {} jobs (older than {})",
                capitalize(action),
                count,
                threshold
            ));
        }
        _ => output::print_item(
            &serde_json::json!({ "action": action, "count": count, "older_than": threshold }),
            format,
        )?,
    }
    Ok(())
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
