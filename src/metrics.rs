/// Metrics for the federation metadata resolver
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Resolution outcomes and cache hit/miss rates
/// - Origin fetch counts and latencies
/// - Backing store size and full-pull refresh timestamps
/// - Background job execution
/// - Artifact map operations

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter_vec, register_int_gauge_vec,
    Encoder, Gauge, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

lazy_static! {
    // ========== HTTP Metrics ==========

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    // ========== Resolution Metrics ==========

    /// Resolve calls by resolver and outcome
    pub static ref RESOLUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "metadata_resolutions_total",
        "Total number of metadata resolutions",
        &["resolver", "outcome"]
    )
    .unwrap();

    /// Backing store hits by resolver
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "metadata_cache_hits_total",
        "Total number of backing store hits",
        &["resolver"]
    )
    .unwrap();

    /// Backing store misses by resolver
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "metadata_cache_misses_total",
        "Total number of backing store misses",
        &["resolver"]
    )
    .unwrap();

    /// Entities currently held in the backing store
    pub static ref BACKING_STORE_ENTITIES: IntGaugeVec = register_int_gauge_vec!(
        "metadata_backing_store_entities",
        "Number of entities in the backing store",
        &["resolver"]
    )
    .unwrap();

    // ========== Origin Fetch Metrics ==========

    /// Origin fetches by source and outcome
    pub static ref ORIGIN_FETCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "metadata_origin_fetches_total",
        "Total number of origin fetches",
        &["source", "outcome"]
    )
    .unwrap();

    /// Origin fetch duration in seconds
    pub static ref ORIGIN_FETCH_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "metadata_origin_fetch_duration_seconds",
        "Origin fetch latencies in seconds",
        &["source"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    /// Unix timestamps of the last refresh attempt and last successful update
    pub static ref REFRESH_TIMESTAMP_SECONDS: IntGaugeVec = register_int_gauge_vec!(
        "metadata_refresh_timestamp_seconds",
        "Unix time of the last refresh attempt or data update",
        &["resolver", "kind"]
    )
    .unwrap();

    // ========== Background Job Metrics ==========

    /// Background job executions by job type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "background_jobs_total",
        "Total number of background job executions",
        &["job_type", "status"]
    )
    .unwrap();

    /// Background job duration in seconds
    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "background_job_duration_seconds",
        "Background job execution time in seconds",
        &["job_type"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    // ========== Artifact Metrics ==========

    /// Artifact map operations by operation and outcome
    pub static ref ARTIFACT_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "artifact_operations_total",
        "Total number of artifact map operations",
        &["operation", "outcome"]
    )
    .unwrap();

    // ========== Error Metrics ==========

    /// Errors by error type
    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "errors_total",
        "Total number of errors",
        &["error_type", "module"]
    )
    .unwrap();

    // ========== System Metrics ==========

    /// Application uptime in seconds
    pub static ref UPTIME_SECONDS: Gauge = register_gauge!(
        "uptime_seconds",
        "Application uptime in seconds"
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
}

/// Record the outcome of a resolve call
pub fn record_resolution(resolver: &str, outcome: &str) {
    RESOLUTIONS_TOTAL
        .with_label_values(&[resolver, outcome])
        .inc();
}

/// Record a backing store access
pub fn record_cache_access(resolver: &str, hit: bool) {
    if hit {
        CACHE_HITS_TOTAL.with_label_values(&[resolver]).inc();
    } else {
        CACHE_MISSES_TOTAL.with_label_values(&[resolver]).inc();
    }
}

/// Record an origin fetch
pub fn record_origin_fetch(source: &str, outcome: &str, duration: f64) {
    ORIGIN_FETCHES_TOTAL
        .with_label_values(&[source, outcome])
        .inc();
    ORIGIN_FETCH_DURATION_SECONDS
        .with_label_values(&[source])
        .observe(duration);
}

/// Update the backing store size gauge
pub fn set_backing_store_size(resolver: &str, entities: usize) {
    BACKING_STORE_ENTITIES
        .with_label_values(&[resolver])
        .set(entities as i64);
}

/// Record a full-pull refresh timestamp ("refresh" or "update")
pub fn record_refresh_timestamp(resolver: &str, kind: &str, unix_seconds: i64) {
    REFRESH_TIMESTAMP_SECONDS
        .with_label_values(&[resolver, kind])
        .set(unix_seconds);
}

/// Record a background job execution
pub fn record_background_job(job_type: &str, status: &str, duration: f64) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration);
}

/// Record an artifact map operation
pub fn record_artifact_operation(operation: &str, outcome: &str) {
    ARTIFACT_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

/// Record an error
pub fn record_error(error_type: &str, module: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error_type, module])
        .inc();
}
