//! Prometheus metrics for upload sessions.
//!
//! Metric name constants are recorded through the `metrics` facade from the
//! coordinator and retry loop.  Without an installed recorder they are
//! no-ops; the CLI installs the `metrics-exporter-prometheus` recorder via
//! [`init_metrics`] and can render the exposition text at exit.

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Parts acknowledged by the service (counter).
pub const PARTS_UPLOADED_TOTAL: &str = "s3stream_parts_uploaded_total";

/// Payload bytes in acknowledged parts (counter).
pub const BYTES_UPLOADED_TOTAL: &str = "s3stream_bytes_uploaded_total";

/// Transient-error retries (counter). Labels: operation.
pub const TRANSIENT_RETRIES_TOTAL: &str = "s3stream_transient_retries_total";

/// Sessions reaching a terminal state (counter). Labels: outcome.
pub const SESSIONS_TOTAL: &str = "s3stream_sessions_total";

/// Wall time of one part upload including retries, in seconds (histogram).
pub const PART_UPLOAD_DURATION_SECONDS: &str = "s3stream_part_upload_duration_seconds";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder.  Idempotent.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(PARTS_UPLOADED_TOTAL, "Parts acknowledged by the service");
    describe_counter!(BYTES_UPLOADED_TOTAL, "Payload bytes in acknowledged parts");
    describe_counter!(
        TRANSIENT_RETRIES_TOTAL,
        "Retries after a session-not-yet-visible error"
    );
    describe_counter!(SESSIONS_TOTAL, "Upload sessions by terminal outcome");
    describe_histogram!(
        PART_UPLOAD_DURATION_SECONDS,
        "Part upload duration in seconds, including retries"
    );
}

/// Render Prometheus exposition format text, if the recorder is installed.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}
