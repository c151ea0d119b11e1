//! Metrics collection and Prometheus export.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub const SECURED_RECORDS_CORRUPTED: &str = "secured_records_corrupted_total";
pub const SESSION_REAPER_DELETED: &str = "session_reaper_deleted_total";
pub const SESSION_REAPER_FAILURES: &str = "session_reaper_failures_total";
pub const SESSION_TOKENS_REJECTED: &str = "session_tokens_rejected_total";

/// Global handle to the Prometheus recorder.
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Call once at startup, before any metric
/// is recorded.
pub fn init_metrics() -> Result<(), anyhow::Error> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;

    METRICS_HANDLE
        .set(handle)
        .map_err(|_| anyhow::anyhow!("metrics recorder already initialized"))?;

    metrics::describe_counter!(
        SECURED_RECORDS_CORRUPTED,
        "Stored records whose signature failed verification"
    );
    metrics::describe_counter!(SESSION_REAPER_DELETED, "Expired sessions deleted");
    metrics::describe_counter!(
        SESSION_REAPER_FAILURES,
        "Expired sessions the reaper failed to delete"
    );
    metrics::describe_counter!(SESSION_TOKENS_REJECTED, "Session tokens refused");
    Ok(())
}

/// Current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}
