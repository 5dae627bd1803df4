use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_int_counter, CounterVec, Histogram,
    IntCounter,
};

lazy_static! {
    // Admission metrics
    pub static ref CHECKS_TOTAL: CounterVec = register_counter_vec!(
        "admitr_checks_total",
        "Total number of token bucket checks",
        &["result"]
    ).unwrap();

    pub static ref CHECK_DURATION: Histogram = register_histogram!(
        "admitr_check_duration_seconds",
        "Token bucket check duration in seconds, storage round trips included",
        vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    ).unwrap();

    // Storage metrics
    pub static ref STORAGE_FALLBACK_READS_TOTAL: IntCounter = register_int_counter!(
        "admitr_storage_fallback_reads_total",
        "Bucket reads served by the fallback store after a primary failure"
    ).unwrap();

    pub static ref STORAGE_WRITE_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "admitr_storage_write_failures_total",
        "Bucket writes that failed and were dropped",
        &["store"]
    ).unwrap();

    // Security metrics
    pub static ref BYPASS_TOTAL: CounterVec = register_counter_vec!(
        "admitr_bypass_total",
        "Requests exempted from rate limiting",
        &["reason"]
    ).unwrap();

    pub static ref IP_BLOCKS_TOTAL: IntCounter = register_int_counter!(
        "admitr_ip_blocks_total",
        "Blocks written after repeated failed attempts"
    ).unwrap();

    // Config metrics
    pub static ref CONFIG_RELOADS_TOTAL: CounterVec = register_counter_vec!(
        "admitr_config_reloads_total",
        "Total number of configuration reloads",
        &["result"]
    ).unwrap();
}

/// Record the outcome and latency of a bucket check
pub fn record_check(result: &str, duration_secs: f64) {
    CHECKS_TOTAL.with_label_values(&[result]).inc();
    CHECK_DURATION.observe(duration_secs);
}

pub fn record_fallback_read() {
    STORAGE_FALLBACK_READS_TOTAL.inc();
}

/// Record a dropped write; `store` is "primary" or "fallback"
pub fn record_write_failure(store: &str) {
    STORAGE_WRITE_FAILURES_TOTAL.with_label_values(&[store]).inc();
}

pub fn record_bypass(reason: &str) {
    BYPASS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_ip_block() {
    IP_BLOCKS_TOTAL.inc();
}

/// Record config reload
pub fn record_config_reload(success: bool) {
    let result = if success { "success" } else { "error" };
    CONFIG_RELOADS_TOTAL.with_label_values(&[result]).inc();
}

/// Render every registered metric in the Prometheus text format, for whatever
/// endpoint the embedding service exposes.
pub fn gather_text() -> crate::errors::Result<String> {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::errors::AdmitError::Serialization(format!("Failed to encode metrics: {}", e)))?;

    String::from_utf8(buffer).map_err(|e| {
        crate::errors::AdmitError::Serialization(format!("Metrics are not valid UTF-8: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_text_includes_recorded_metrics() {
        record_ip_block();
        record_bypass("token");

        let text = gather_text().unwrap();
        assert!(text.contains("admitr_ip_blocks_total"));
        assert!(text.contains("admitr_bypass_total{reason=\"token\"}"));
    }
}
