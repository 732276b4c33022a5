//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Sync job outcomes and durations
//! - Pulled/pushed action counts
//! - Conflict detection
//! - Error classification
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `detached_sync_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use crate::error::ErrorKind;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a finished sync job.
pub fn record_sync_job(container: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("detached_sync_jobs_total", "container" => container.to_string(), "status" => status)
        .increment(1);
    histogram!("detached_sync_job_duration_seconds", "container" => container.to_string())
        .record(duration.as_secs_f64());
}

/// Record actions applied from a pulled delta.
pub fn record_actions_pulled(container: &str, count: usize) {
    counter!("detached_sync_actions_pulled_total", "container" => container.to_string())
        .increment(count as u64);
}

/// Record actions uploaded and acknowledged.
pub fn record_actions_pushed(container: &str, count: usize) {
    counter!("detached_sync_actions_pushed_total", "container" => container.to_string())
        .increment(count as u64);
}

/// Record remote actions skipped during apply (unknown feature ids).
pub fn record_apply_skipped(container: &str, count: usize) {
    if count > 0 {
        counter!("detached_sync_apply_skipped_total", "container" => container.to_string())
            .increment(count as u64);
    }
}

/// Record conflicts found by the detector.
pub fn record_conflicts(container: &str, count: usize) {
    if count > 0 {
        counter!("detached_sync_conflicts_total", "container" => container.to_string())
            .increment(count as u64);
    }
}

/// Record a job failure by error classification.
pub fn record_error(container: &str, kind: ErrorKind) {
    counter!(
        "detached_sync_errors_total",
        "container" => container.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record one aux metadata refresh.
pub fn record_aux_refresh(container: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("detached_sync_aux_refreshes_total", "container" => container.to_string(), "status" => status)
        .increment(1);
}

/// Gauge for replicas currently tracked by the scheduler.
pub fn set_tracked_replicas(count: usize) {
    gauge!("detached_sync_tracked_replicas").set(count as f64);
}

/// Gauge for per-replica state, encoded numerically for alerting
/// (0=not_initialized, 1=synchronizing, 2=synchronized, 3=not_synchronized,
/// 4=error).
pub fn set_replica_state(container: &str, state: &str) {
    let value = match state {
        "not_initialized" => 0.0,
        "synchronizing" => 1.0,
        "synchronized" => 2.0,
        "not_synchronized" => 3.0,
        "error" => 4.0,
        _ => -1.0,
    };
    gauge!("detached_sync_replica_state", "container" => container.to_string()).set(value);
}
