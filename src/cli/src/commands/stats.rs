//! `kiln stats`

use anyhow::Result;
use kiln_core::jobs::{JobStore, QueueStats};
use tabled::Tabled;

use crate::output::{self, OutputFormat};

#[derive(Tabled)]
struct StatRow {
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Jobs")]
    count: u64,
}

fn rows(stats: &QueueStats) -> Vec<StatRow> {
    [
        ("queued", stats.queued),
        ("running", stats.running),
        ("succeeded", stats.succeeded),
        ("failed", stats.failed),
        ("canceled", stats.canceled),
        ("dead", stats.dead),
    ]
    .into_iter()
    .map(|(status, count)| StatRow {
        status: output::status_label(status),
        count,
    })
    .collect()
}

pub async fn execute(store: &dyn JobStore, format: OutputFormat) -> Result<()> {
    let stats = store.stats().await?;

    if format != OutputFormat::Table {
        return output::print_item(&stats, format);
    }

    if let Some(table) = output::render_table(&rows(&stats)) {
        println!("{}", table);
    }
    output::print_detail("Dead letters", &stats.dead_letters.to_string());
    if stats.dead_letters > 0 {
        output::print_warning("Inspect with `kiln dead-letters`");
    }
    Ok(())
}
