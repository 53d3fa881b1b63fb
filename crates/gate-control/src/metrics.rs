//! Prometheus metrics for the control plane engines
//!
//! This module is only compiled when the `metrics` feature is enabled.
//!
//! Exposed metrics:
//! - `access_operations_total` - Counter for engine operations by outcome
//! - `access_operation_duration_seconds` - Histogram for operation latencies

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use tablegate_core::{ControlError, Result};

lazy_static! {
    /// Counter for engine operations by operation and status
    pub static ref ACCESS_OPERATIONS_TOTAL: CounterVec = register_counter_vec!(
        "access_operations_total",
        "Total number of access-control operations",
        &["operation", "status"]
    )
    .unwrap();

    /// Histogram for engine operation duration in seconds
    pub static ref ACCESS_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "access_operation_duration_seconds",
        "Access-control operation latency in seconds",
        &["operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();
}

/// Outcome label: `ok`, `rejected` for caller mistakes, `error` otherwise.
pub fn status_label<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) if e.is_user_error() => "rejected",
        Err(_) => "error",
    }
}

/// Record an engine operation metric
pub fn record_operation<T>(operation: &str, result: &Result<T>, duration_secs: f64) {
    ACCESS_OPERATIONS_TOTAL
        .with_label_values(&[operation, status_label(result)])
        .inc();
    ACCESS_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> std::result::Result<String, ControlError> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| ControlError::Other(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| ControlError::Other(format!("Failed to encode metrics: {}", e)))
}
