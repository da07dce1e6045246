//! Driver metrics.
//!
//! Counters go through the `metrics` facade and are free when no recorder
//! is installed.  The CLI installs a Prometheus recorder with
//! [`init_metrics`] and prints the rendered text on exit.

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Boundary operations (counter). Labels: operation, status.
pub const OPERATIONS_TOTAL: &str = "gcs_driver_operations_total";

/// Bytes delivered to callers by reads and downloads (counter).
pub const BYTES_READ_TOTAL: &str = "gcs_driver_bytes_read_total";

/// Bytes accepted from callers by writes and uploads (counter).
pub const BYTES_WRITTEN_TOTAL: &str = "gcs_driver_bytes_written_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder.  Idempotent.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(OPERATIONS_TOTAL, "Driver operations by type and outcome");
    describe_counter!(BYTES_READ_TOTAL, "Bytes read from virtual files");
    describe_counter!(BYTES_WRITTEN_TOTAL, "Bytes written to write and append sessions");
}

// -- Recording helpers --------------------------------------------------------

pub fn record_operation(operation: &'static str, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    counter!(OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);
}

pub fn record_bytes_read(n: u64) {
    counter!(BYTES_READ_TOTAL).increment(n);
}

pub fn record_bytes_written(n: u64) {
    counter!(BYTES_WRITTEN_TOTAL).increment(n);
}
