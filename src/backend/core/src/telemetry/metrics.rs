//! Job engine metrics and the optional Prometheus exporter.
//!
//! Metrics are recorded through the `metrics` facade; without an installed
//! recorder every call is a no-op, so library code records unconditionally.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::jobs::{CompletionOutcome, JobKind};

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Serve a Prometheus scrape endpoint
    #[serde(default)]
    pub enabled: bool,

    /// Listen address of the exporter
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_metrics_endpoint(),
            duration_buckets: default_duration_buckets(),
        }
    }
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9464".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
}

/// Install the Prometheus recorder and HTTP listener when enabled.
///
/// # Errors
///
/// Returns an error if the endpoint is not a socket address or the recorder
/// cannot be installed.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.endpoint.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(&config.duration_buckets)?
        .install()?;

    register_metric_descriptions();
    tracing::info!(endpoint = %addr, "Prometheus exporter listening");
    Ok(())
}

fn register_metric_descriptions() {
    describe_counter!("kiln_jobs_fetched_total", "Jobs pushed into the pending buffer");
    describe_counter!("kiln_jobs_claimed_total", "Jobs claimed by this worker");
    describe_counter!(
        "kiln_jobs_claim_lost_total",
        "Claims abandoned because another worker won"
    );
    describe_counter!(
        "kiln_jobs_completed_total",
        "Attempts reconciled into the store, by kind and outcome"
    );
    describe_histogram!(
        "kiln_job_duration_seconds",
        "Handler execution time in seconds"
    );
    describe_gauge!("kiln_jobs_in_flight", "Executions currently running");
    describe_gauge!("kiln_pending_buffer_depth", "Jobs waiting in the pending buffer");
    describe_counter!("kiln_jobs_reaped_total", "Stale running jobs returned to queued");
    describe_counter!("kiln_errors_total", "Errors by code and category");
}

/// Recording helpers used by the worker loops.
pub struct JobMetrics;

impl JobMetrics {
    pub fn fetched(count: usize) {
        counter!("kiln_jobs_fetched_total").increment(count as u64);
    }

    pub fn buffer_depth(depth: usize) {
        gauge!("kiln_pending_buffer_depth").set(depth as f64);
    }

    pub fn claimed(kind: JobKind) {
        counter!("kiln_jobs_claimed_total", "kind" => kind.as_str()).increment(1);
    }

    pub fn claim_lost(kind: JobKind) {
        counter!("kiln_jobs_claim_lost_total", "kind" => kind.as_str()).increment(1);
    }

    pub fn started() {
        gauge!("kiln_jobs_in_flight").increment(1.0);
    }

    pub fn finished(kind: JobKind, elapsed: Duration) {
        gauge!("kiln_jobs_in_flight").decrement(1.0);
        histogram!("kiln_job_duration_seconds", "kind" => kind.as_str())
            .record(elapsed.as_secs_f64());
    }

    pub fn completed(kind: JobKind, outcome: &CompletionOutcome) {
        counter!(
            "kiln_jobs_completed_total",
            "kind" => kind.as_str(),
            "outcome" => outcome.as_str(),
        )
        .increment(1);
    }

    pub fn reaped(count: u64) {
        counter!("kiln_jobs_reaped_total").increment(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_is_noop() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let config = MetricsConfig {
            enabled: true,
            endpoint: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(init_metrics(&config).is_err());
    }

    #[test]
    fn test_recording_without_recorder() {
        JobMetrics::claimed(JobKind::Generic);
        JobMetrics::started();
        JobMetrics::finished(JobKind::Generic, Duration::from_millis(5));
        JobMetrics::completed(JobKind::Generic, &CompletionOutcome::Succeeded);
    }
}
