//! Prometheus Metrics
//!
//! Metrics include:
//! - upstream requests by endpoint and status, plus 429 retries
//! - time spent waiting on the rate limiter
//! - ingestion runs by outcome and their duration
//! - rows written per table

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, Encoder, Histogram,
    HistogramOpts, HistogramVec, IntCounterVec, TextEncoder,
};
use tracing::error;

// ============================================
// METRIC DEFINITIONS
// ============================================

pub const OUTCOME_COMPLETED: &str = "completed";
pub const OUTCOME_SKIPPED: &str = "skipped";
pub const OUTCOME_FAILED: &str = "failed";

pub const TABLE_CONTENT: &str = "top_casts";
pub const TABLE_AUTHORS: &str = "users";

static UPSTREAM_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "castboard_upstream_requests_total",
        "Upstream API requests by endpoint and HTTP status",
        &["endpoint", "status"]
    )
    .expect("Failed to create upstream_requests metric")
});

static UPSTREAM_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "castboard_upstream_retries_total",
        "Retries after HTTP 429 by endpoint",
        &["endpoint"]
    )
    .expect("Failed to create upstream_retries metric")
});

// Only non-zero waits are observed
static RATE_LIMIT_WAIT: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(HistogramOpts::new(
        "castboard_rate_limit_wait_seconds",
        "Time spent waiting for a rate limiter slot"
    )
    .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]))
    .expect("Failed to create rate_limit_wait metric")
});

static INGEST_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "castboard_ingest_runs_total",
        "Ingestion runs by outcome",
        &["outcome"]
    )
    .expect("Failed to create ingest_runs metric")
});

static ROWS_UPSERTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "castboard_rows_upserted_total",
        "Rows merge-upserted per table",
        &["table"]
    )
    .expect("Failed to create rows_upserted metric")
});

static RUN_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        HistogramOpts::new(
            "castboard_ingest_run_duration_seconds",
            "Wall-clock duration of ingestion runs"
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["outcome"]
    )
    .expect("Failed to create run_duration metric")
});

// ============================================
// METRICS API
// ============================================

pub fn record_upstream_request(endpoint: &str, status: u16) {
    UPSTREAM_REQUESTS
        .with_label_values(&[endpoint, &status.to_string()])
        .inc();
}

pub fn record_retry(endpoint: &str) {
    UPSTREAM_RETRIES.with_label_values(&[endpoint]).inc();
}

pub fn record_rate_limit_wait(wait_secs: f64) {
    RATE_LIMIT_WAIT.observe(wait_secs);
}

pub fn record_run(outcome: &str, duration_secs: f64) {
    INGEST_RUNS.with_label_values(&[outcome]).inc();
    RUN_DURATION.with_label_values(&[outcome]).observe(duration_secs);
}

pub fn record_rows_upserted(table: &str, count: usize) {
    ROWS_UPSERTED.with_label_values(&[table]).inc_by(count as u64);
}

// ============================================
// METRICS COLLECTION
// ============================================

/// Collects all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}
