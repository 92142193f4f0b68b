//! Prometheus metrics exposition
//!
//! Installs the recorder for every counter in the workspace. The core crate
//! emits `token_refresh_total`, `token_refresh_failures_total`,
//! `proactive_refresh_scheduled_total` and `health_checks_throttled_total`;
//! the worker adds:
//!
//! - `refresh_jobs_total` (counter): label `result`
//! - `refresh_job_duration_seconds` (histogram): label `result`
//! - `refresh_job_retries_total` (counter): label `error_kind`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Refresh calls are bounded by the provider timeout plus the lock wait.
const JOB_DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("refresh_job_duration_seconds".to_string()),
        JOB_DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder globally and return a handle for `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a finished refresh job by its `RefreshResult` label.
pub fn record_job(result: &str, duration_secs: f64) {
    metrics::counter!("refresh_jobs_total", "result" => result.to_string()).increment(1);
    metrics::histogram!("refresh_job_duration_seconds", "result" => result.to_string())
        .record(duration_secs);
}

/// Record a failed job being put back on the queue.
pub fn record_retry(error_kind: &str) {
    metrics::counter!("refresh_job_retries_total", "error_kind" => error_kind.to_string())
        .increment(1);
}
