//! Prometheus metrics

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, Histogram, HistogramVec, IntCounterVec, IntGauge,
    IntGaugeVec, TextEncoder,
};

lazy_static! {
    /// 1 while the daemon is running, 0 once shutdown begins.
    pub static ref UP: IntGauge = register_int_gauge!(
        "orchestrator_up",
        "Whether the orchestrator daemon is running"
    )
    .expect("metric registration");

    /// State transitions applied, by kind and target state.
    pub static ref TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "orchestrator_transitions_total",
        "Instruction state transitions applied",
        &["kind", "to_state"]
    )
    .expect("metric registration");

    /// Non-terminal records seen by the last sweep, by kind.
    pub static ref RECORDS_IN_FLIGHT: IntGaugeVec = register_int_gauge_vec!(
        "orchestrator_records_in_flight",
        "Non-terminal instruction records per kind",
        &["kind"]
    )
    .expect("metric registration");

    /// Sweep wall time, by kind.
    pub static ref SWEEP_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "orchestrator_sweep_duration_seconds",
        "Poll sweep duration per kind",
        &["kind"]
    )
    .expect("metric registration");

    /// Time spent assembling one event proof bundle, evidence fetch included.
    pub static ref PROOF_BUILD_DURATION_SECONDS: Histogram = register_histogram!(
        "orchestrator_proof_build_duration_seconds",
        "Event proof construction duration"
    )
    .expect("metric registration");

    /// Callback delivery attempts by outcome (delivered / failed).
    pub static ref CALLBACK_DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "orchestrator_callback_deliveries_total",
        "Callback delivery attempts",
        &["outcome"]
    )
    .expect("metric registration");

    /// Ledger operation errors by network and class (transient / failed / configuration).
    pub static ref LEDGER_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "orchestrator_ledger_errors_total",
        "Ledger connector errors",
        &["system_id", "class"]
    )
    .expect("metric registration");

    /// External update requests by disposition (applied / rejected).
    pub static ref UPDATE_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "orchestrator_update_requests_total",
        "External state update requests",
        &["disposition"]
    )
    .expect("metric registration");
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_render() {
        TRANSITIONS_TOTAL
            .with_label_values(&["settlement", "processed"])
            .inc();
        RECORDS_IN_FLIGHT.with_label_values(&["swap"]).set(3);
        let rendered = gather();
        assert!(rendered.contains("orchestrator_transitions_total"));
        assert!(rendered.contains("orchestrator_records_in_flight"));
    }
}
