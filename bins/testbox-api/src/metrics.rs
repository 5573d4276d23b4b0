// Prometheus metrics exposed on GET /metrics

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Encoder, Histogram,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Finished runs by overall status, or by error kind when no report was produced
    pub static ref RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "testbox_runs_total",
        "Execution requests handled",
        &["status"]
    )
    .unwrap();

    pub static ref RUN_DURATION: Histogram = register_histogram!(
        "testbox_run_duration_seconds",
        "Wall time of POST /run from admission to response",
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .unwrap();

    pub static ref IMAGE_OPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "testbox_image_operations_total",
        "Custom image builds and removals",
        &["operation", "outcome"]
    )
    .unwrap();

    pub static ref ACTIVE_RUNS: IntGauge = register_int_gauge!(
        "testbox_active_runs",
        "Runs currently holding an admission permit"
    )
    .unwrap();
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
