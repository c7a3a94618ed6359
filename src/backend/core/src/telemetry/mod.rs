//! Telemetry: structured logging and job metrics.
//!
//! - **Logging**: `tracing` subscriber with JSON/pretty/compact output
//! - **Metrics**: counters and histograms for the job lifecycle, optionally
//!   scraped through a Prometheus endpoint
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_core::telemetry::{init_telemetry, ObservabilityConfig};
//!
//! init_telemetry(&ObservabilityConfig::default()).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, JobMetrics, MetricsConfig};

use serde::Deserialize;

/// `observability` section of the configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Initialize logging and metrics. Call once at start-up.
///
/// # Errors
///
/// Returns an error if either component fails to initialize.
pub fn init_telemetry(config: &ObservabilityConfig) -> anyhow::Result<()> {
    init_logging(&config.logging)?;
    init_metrics(&config.metrics)?;
    Ok(())
}
