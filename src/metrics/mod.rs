mod tracker;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::{
    self, opts, register_gauge_vec, register_histogram_vec, register_int_counter_vec, Encoder,
    GaugeVec, HistogramVec, IntCounterVec,
};

use crate::error::FailureKind;

pub use tracker::Tracker;

static BRIDGES_CONNECTED: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("redmux_bridge_connected", "established bridges per endpoint"),
        &["endpoint", "purpose"]
    )
    .expect("bridge gauge registration must succeed")
});

static CONNECT_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("redmux_connect_attempts", "connection attempts by outcome"),
        &["endpoint", "result"]
    )
    .expect("connect counter registration must succeed")
});

static CONNECTION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "redmux_connection_failures",
            "physical connections torn down, by failure kind"
        ),
        &["endpoint", "kind"]
    )
    .expect("failure counter registration must succeed")
});

static OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("redmux_operations", "messages written to the socket"),
        &["endpoint"]
    )
    .expect("operations counter registration must succeed")
});

static COMMAND_RESULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("redmux_command_results", "completed caller commands by result"),
        &["result"]
    )
    .expect("result counter registration must succeed")
});

static REDIRECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("redmux_redirects", "cluster redirects followed"),
        &["kind"]
    )
    .expect("redirect counter registration must succeed")
});

static RECONFIGURATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("redmux_reconfigurations", "topology refresh runs by outcome"),
        &["outcome"]
    )
    .expect("reconfiguration counter registration must succeed")
});

static COMMAND_TIMER: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "redmux_command_timer",
        "caller-observed command latency in microseconds",
        &["command"],
        vec![100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0]
    )
    .expect("command timer histogram registration must succeed")
});

pub fn bridge_connected(endpoint: &str, purpose: &str) {
    BRIDGES_CONNECTED
        .with_label_values(&[endpoint, purpose])
        .set(1.0);
}

pub fn bridge_disconnected(endpoint: &str, purpose: &str) {
    BRIDGES_CONNECTED
        .with_label_values(&[endpoint, purpose])
        .set(0.0);
}

pub fn connect_attempt(endpoint: &str, success: bool) {
    let result = if success { "ok" } else { "error" };
    CONNECT_ATTEMPTS
        .with_label_values(&[endpoint, result])
        .inc();
}

pub fn connect_attempts(endpoint: &str, success: bool) -> u64 {
    let result = if success { "ok" } else { "error" };
    CONNECT_ATTEMPTS
        .with_label_values(&[endpoint, result])
        .get()
}

pub fn connection_failure(endpoint: &str, kind: FailureKind) {
    CONNECTION_FAILURES
        .with_label_values(&[endpoint, kind.as_str()])
        .inc();
}

pub fn connection_failures(endpoint: &str, kind: FailureKind) -> u64 {
    CONNECTION_FAILURES
        .with_label_values(&[endpoint, kind.as_str()])
        .get()
}

pub fn operations_written(endpoint: &str, count: u64) {
    OPERATIONS.with_label_values(&[endpoint]).inc_by(count);
}

pub fn command_result(result: &str) {
    COMMAND_RESULTS.with_label_values(&[result]).inc();
}

pub fn redirect(kind: &str) {
    REDIRECTS.with_label_values(&[kind]).inc();
}

pub fn reconfiguration(outcome: &str) {
    RECONFIGURATIONS.with_label_values(&[outcome]).inc();
}

pub fn reconfigurations(outcome: &str) -> u64 {
    RECONFIGURATIONS.with_label_values(&[outcome]).get()
}

/// Create a tracker for caller-observed latency of `command`.
pub fn command_tracker(command: &str) -> Tracker {
    Tracker::new(COMMAND_TIMER.with_label_values(&[command]))
}

/// Render every registered metric in the prometheus text format, for
/// embedding applications that run their own exporter.
pub fn render() -> Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .context("failed to encode prometheus metrics")?;
    String::from_utf8(buffer).context("prometheus output is not utf-8")
}
