//! Presence metrics

use crate::domain::call::value_object::LeaveReason;
use crate::domain::occupancy::{OccupancyOutcome, ProbeExit};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const OCCUPANCY_CHECKS_TOTAL: &str = "presence_occupancy_checks_total";
pub const AUTO_LEAVE_TOTAL: &str = "presence_auto_leave_total";
pub const PROBE_JOINS_TOTAL: &str = "presence_probe_joins_total";
pub const TRANSPORT_FAILURES_TOTAL: &str = "presence_transport_failures_total";
pub const PARTICIPANTS: &str = "presence_participants";

/// Install the Prometheus recorder and describe presence metrics
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

/// Register metric descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!(
        OCCUPANCY_CHECKS_TOTAL,
        "Discovery-window occupancy decisions, by outcome"
    );
    describe_counter!(
        AUTO_LEAVE_TOTAL,
        "Channels left without a local hang-up, by reason"
    );
    describe_counter!(
        PROBE_JOINS_TOTAL,
        "Probe joins run during resume recovery, by outcome"
    );
    describe_counter!(
        TRANSPORT_FAILURES_TOTAL,
        "Transport requests or callbacks that failed, by operation"
    );
    describe_gauge!(
        PARTICIPANTS,
        "Remote participants in the currently joined channel"
    );
}

pub fn record_occupancy(outcome: &OccupancyOutcome) {
    counter!(OCCUPANCY_CHECKS_TOTAL, "outcome" => outcome.as_str()).increment(1);
}

pub fn record_auto_leave(reason: LeaveReason) {
    counter!(AUTO_LEAVE_TOTAL, "reason" => reason.as_str()).increment(1);
}

pub fn record_probe(outcome: &OccupancyOutcome, exit: ProbeExit) {
    counter!(
        PROBE_JOINS_TOTAL,
        "outcome" => outcome.as_str(),
        "exit" => format!("{:?}", exit).to_lowercase()
    )
    .increment(1);
}

pub fn record_transport_failure(operation: &'static str) {
    counter!(TRANSPORT_FAILURES_TOTAL, "operation" => operation).increment(1);
}

pub fn set_participants(count: usize) {
    gauge!(PARTICIPANTS).set(count as f64);
}
