//! Metric names and recording helpers.
//!
//! Instrumentation goes through the `metrics` facade; the binary installs a
//! Prometheus recorder when exposition is enabled, and all of these become
//! no-ops otherwise.

use metrics::{counter, gauge, histogram};

pub const DELIVERIES_RECEIVED: &str = "rec_deliveries_received_total";
pub const DELIVERIES_LATE: &str = "rec_deliveries_late_total";
pub const POLL_ERRORS: &str = "rec_poll_errors_total";
pub const EXECUTIONS: &str = "rec_executions_total";
pub const EXECUTION_DURATION: &str = "rec_execution_duration_seconds";
pub const QUEUE_DEPTH: &str = "rec_queue_depth";
pub const WORKERS_ACTIVE: &str = "rec_workers_active";
pub const REPORTS: &str = "rec_reports_total";
pub const GIT_PULLS: &str = "rec_git_pulls_total";

pub fn deliveries_received(count: usize) {
    counter!(DELIVERIES_RECEIVED).increment(count as u64);
}

/// A delivery dequeued after its visibility deadline elapsed.
pub fn delivery_late() {
    counter!(DELIVERIES_LATE).increment(1);
}

pub fn poll_error() {
    counter!(POLL_ERRORS).increment(1);
}

pub fn execution(kind: &'static str, status: &'static str) {
    counter!(EXECUTIONS, "kind" => kind, "status" => status).increment(1);
}

pub fn execution_duration(kind: &'static str, seconds: f64) {
    histogram!(EXECUTION_DURATION, "kind" => kind).record(seconds);
}

pub fn queue_depth(depth: usize) {
    gauge!(QUEUE_DEPTH).set(depth as f64);
}

pub fn workers_active(count: usize) {
    gauge!(WORKERS_ACTIVE).set(count as f64);
}

pub fn report(status: &'static str) {
    counter!(REPORTS, "status" => status).increment(1);
}

pub fn git_pull(result: &'static str) {
    counter!(GIT_PULLS, "result" => result).increment(1);
}
