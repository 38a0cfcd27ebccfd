use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    // Rate limiting
    pub static ref RATE_LIMIT_DECISIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rate_limit_decisions_total",
        "AI feature admission decisions",
        &["feature", "outcome"]
    )
    .unwrap();

    // Mastery tracking
    pub static ref MASTERY_UPDATES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "mastery_updates_total",
        "Persisted mastery record updates by resulting level",
        &["level"]
    )
    .unwrap();

    pub static ref MASTERY_NOOP_TOTAL: IntCounter = register_int_counter!(
        "mastery_noop_total",
        "Evaluations whose targeted objectives were all mastered already"
    )
    .unwrap();

    // Persistence
    pub static ref STORE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "store_operations_total",
        "Mastery store operations",
        &["store", "operation", "status"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}
