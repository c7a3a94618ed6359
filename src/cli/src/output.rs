//! Output formatting utilities for the Kiln CLI.
//!
//! Supports table, JSON, and YAML output formats.

use anyhow::Result;
use clap::ValueEnum;
use colored::*;
use serde::Serialize;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

/// Output format selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Render as a formatted table
    #[default]
    Table,
    /// Render as JSON
    Json,
    /// Render as YAML
    Yaml,
}

pub fn print_success(msg: &str) {
    println!("{} {}", "[OK]".green().bold(), msg);
}

/// Print an error message to stderr.
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "[WARN]".yellow().bold(), msg);
}

pub fn print_info(msg: &str) {
    println!("{} {}", "[INFO]".blue().bold(), msg);
}

/// Render rows as a rounded table, or `None` when there is nothing to show.
pub fn render_table<T: Tabled>(rows: &[T]) -> Option<String> {
    if rows.is_empty() {
        return None;
    }
    Some(
        Table::new(rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::first()).with(Alignment::left()))
            .to_string(),
    )
}

/// Print a list of records. Table output goes through the `Tabled` row type,
/// JSON and YAML serialize the records themselves.
pub fn print_list<T, R>(items: &[T], format: OutputFormat, to_row: impl Fn(&T) -> R) -> Result<()>
where
    T: Serialize,
    R: Tabled,
{
    match format {
        OutputFormat::Table => {
            let rows: Vec<R> = items.iter().map(to_row).collect();
            match render_table(&rows) {
                Some(table) => println!("{}", table),
                None => println!("{}", "No results found.".dimmed()),
            }
        }
        _ => print_item(&items, format)?,
    }
    Ok(())
}

/// Print a single item as JSON or YAML. Table format falls back to JSON.
pub fn print_item<T: Serialize + ?Sized>(item: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table | OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(item)?);
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(item)?);
        }
    }
    Ok(())
}

/// Print key-value details to the terminal (table output only).
pub fn print_detail(key: &str, value: &str) {
    println!("  {}: {}", key.cyan(), value);
}

pub fn print_header(title: &str) {
    println!();
    println!("{}", title.bold().underline());
    println!();
}

/// Truncate long cell values for table output.
pub fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let mut out: String = value.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Colorize a job status label.
pub fn status_label(status: &str) -> String {
    match status {
        "succeeded" => status.green().to_string(),
        "running" => status.cyan().to_string(),
        "queued" => status.blue().to_string(),
        "failed" => status.yellow().to_string(),
        "dead" => status.red().bold().to_string(),
        _ => status.dimmed().to_string(),
    }
}
