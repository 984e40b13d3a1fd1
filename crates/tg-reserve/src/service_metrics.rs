//! Metrics for the reservation coordinator
//!
//! Emitted through the `metrics` facade; nothing is recorded unless the host
//! installs a recorder.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use tg_common::OutcomeStatus;

/// Record a terminal reservation outcome
pub fn record_outcome(resource: &str, status: OutcomeStatus) {
    counter!(
        "tg_reservations_total",
        "resource" => resource.to_string(),
        "status" => status.as_str()
    )
    .increment(1);
}

/// Record a request rejected before dispatch
pub fn record_rejected(reason: &'static str) {
    counter!("tg_submit_rejected_total", "reason" => reason).increment(1);
}

/// Record how long the external step took
pub fn record_step_latency(resource: &str, duration: Duration) {
    histogram!(
        "tg_external_step_duration_seconds",
        "resource" => resource.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn set_counter_level(resource: &str, level: u32) {
    gauge!("tg_counter_level", "resource" => resource.to_string()).set(level as f64);
}

pub fn set_gate_outstanding(gate: &str, outstanding: u32) {
    gauge!("tg_gate_outstanding", "gate" => gate.to_string()).set(outstanding as f64);
}

pub fn set_queue_depth(depth: u32) {
    gauge!("tg_queue_depth").set(depth as f64);
}

pub fn set_active_workers(count: u32) {
    gauge!("tg_active_workers").set(count as f64);
}
