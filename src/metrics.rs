//! Prometheus metrics registry.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Decisions by verdict and engine
    pub static ref DECISIONS_TOTAL: CounterVec = register_counter_vec!(
        "aegis_decisions_total",
        "Policy decisions by verdict and engine",
        &["verdict", "engine"]
    )
    .expect("metric registration");

    /// Routed tool calls by upstream and outcome
    pub static ref ROUTED_CALLS_TOTAL: CounterVec = register_counter_vec!(
        "aegis_routed_calls_total",
        "Tool calls routed to upstreams",
        &["upstream", "outcome"]
    )
    .expect("metric registration");

    /// End-to-end gateway request latency
    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "aegis_request_duration_seconds",
        "Gateway request latency by method",
        &["method"]
    )
    .expect("metric registration");

    /// Task lifecycle events
    pub static ref TASK_EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "aegis_task_events_total",
        "Task state transitions",
        &["state"]
    )
    .expect("metric registration");
}

/// Render the default registry in Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Metrics encoding failed");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_render() {
        DECISIONS_TOTAL.with_label_values(&["PERMIT", "declarative"]).inc();
        ROUTED_CALLS_TOTAL.with_label_values(&["fs", "success"]).inc();
        TASK_EVENTS_TOTAL.with_label_values(&["SUBMITTED"]).inc();

        let text = render();
        assert!(text.contains("aegis_decisions_total"));
        assert!(text.contains("aegis_routed_calls_total"));
    }
}
