//! Prometheus metrics for the control-loop daemons

use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge,
};
use std::sync::OnceLock;

/// Buckets sized for LAN-scale health probes (seconds).
const POLL_LATENCY_BUCKETS: &[f64] =
    &[0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

static GLOBAL_METRICS: OnceLock<MetricsInner> = OnceLock::new();

struct MetricsInner {
    poll_duration_seconds: HistogramVec,
    polls_total: CounterVec,
    availability_transitions_total: CounterVec,
    probes_running: IntGauge,
    parent_marks_total: CounterVec,
    enroll_documents_total: CounterVec,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            poll_duration_seconds: register_histogram_vec!(
                "control_loop_poll_duration_seconds",
                "Time for one health probe round trip",
                &["kind"],
                POLL_LATENCY_BUCKETS.to_vec()
            )
            .expect("registering poll_duration_seconds"),

            polls_total: register_counter_vec!(
                "control_loop_polls_total",
                "Health probes issued, by kind and result",
                &["kind", "result"]
            )
            .expect("registering polls_total"),

            availability_transitions_total: register_counter_vec!(
                "control_loop_availability_transitions_total",
                "Combined availability transitions, by direction",
                &["direction"]
            )
            .expect("registering availability_transitions_total"),

            probes_running: register_int_gauge!(
                "control_loop_probes_running",
                "Probe tasks currently running"
            )
            .expect("registering probes_running"),

            parent_marks_total: register_counter_vec!(
                "control_loop_parent_marks_total",
                "Parent mark operations issued to the cache, by direction",
                &["direction"]
            )
            .expect("registering parent_marks_total"),

            enroll_documents_total: register_counter_vec!(
                "control_loop_enroll_documents_total",
                "Enrollment documents handled, by type and outcome",
                &["type", "outcome"]
            )
            .expect("registering enroll_documents_total"),
        }
    }
}

/// Cheap handle to the process-wide metrics.
#[derive(Clone)]
pub struct Metrics {
    _private: (),
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MetricsInner {
        GLOBAL_METRICS.get().expect("metrics not initialized")
    }

    pub fn observe_poll(&self, kind: &str, ok: bool, duration_secs: f64) {
        self.inner()
            .poll_duration_seconds
            .with_label_values(&[kind])
            .observe(duration_secs);
        let result = if ok { "success" } else { "failure" };
        self.inner().polls_total.with_label_values(&[kind, result]).inc();
    }

    pub fn inc_transition(&self, available: bool) {
        let direction = if available { "up" } else { "down" };
        self.inner()
            .availability_transitions_total
            .with_label_values(&[direction])
            .inc();
    }

    pub fn set_probes_running(&self, count: i64) {
        self.inner().probes_running.set(count);
    }

    pub fn inc_parent_mark(&self, up: bool) {
        let direction = if up { "up" } else { "down" };
        self.inner().parent_marks_total.with_label_values(&[direction]).inc();
    }

    pub fn inc_enroll_document(&self, ty: &str, outcome: &str) {
        self.inner().enroll_documents_total.with_label_values(&[ty, outcome]).inc();
    }
}
