//! Prometheus Metrics for kvlayer
//!
//! Process-wide counters for every cache and buffer layer, labelled by driver:
//! - Reads by source (buffer or driver)
//! - Writes by mode (buffered or direct)
//! - Flush cycles, their duration and size
//! - Evictions and buffer occupancy

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder, register_histogram_vec,
    register_int_counter_vec, register_int_gauge_vec,
};

lazy_static! {
    /// Reads by source (cache, driver) and status
    pub static ref READS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "kvlayer_reads_total",
        "Total number of reads by source and status",
        &["driver", "source", "status"]
    ).unwrap();

    /// Writes by mode (buffered, direct) and status
    pub static ref WRITES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "kvlayer_writes_total",
        "Total number of accepted writes by mode and status",
        &["driver", "mode", "status"]
    ).unwrap();

    /// Flush cycles that reached the driver
    pub static ref FLUSHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "kvlayer_flushes_total",
        "Total number of bulk flushes by status",
        &["driver", "status"]
    ).unwrap();

    /// Bulk flush latency in seconds
    pub static ref FLUSH_DURATION: HistogramVec = register_histogram_vec!(
        "kvlayer_flush_duration_seconds",
        "Bulk flush latency in seconds",
        &["driver"],
        vec![0.0001, 0.001, 0.01, 0.1, 1.0, 10.0]
    ).unwrap();

    /// Operations handed to the driver by flushes
    pub static ref FLUSHED_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "kvlayer_flushed_operations_total",
        "Total number of operations written by bulk flushes",
        &["driver"]
    ).unwrap();

    /// Entries removed by eviction
    pub static ref EVICTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "kvlayer_evictions_total",
        "Total number of cache entries evicted",
        &["driver"]
    ).unwrap();

    /// Entries currently tracked in the buffer
    pub static ref BUFFER_ENTRIES: IntGaugeVec = register_int_gauge_vec!(
        "kvlayer_buffer_entries",
        "Number of entries tracked by the cache and buffer layer",
        &["driver"]
    ).unwrap();

    /// Failed writes nobody was waiting on
    pub static ref UNATTENDED_WRITE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "kvlayer_unattended_write_failures_total",
        "Total number of failed writes whose acknowledgement was dropped",
        &["driver"]
    ).unwrap();
}

/// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a read
pub fn record_read(driver: &str, source: &str, status: &str) {
    READS_TOTAL.with_label_values(&[driver, source, status]).inc();
}

/// Record an accepted or failed write
pub fn record_write(driver: &str, mode: &str, status: &str) {
    WRITES_TOTAL.with_label_values(&[driver, mode, status]).inc();
}

/// Record a completed bulk flush
pub fn record_flush(driver: &str, status: &str, operations: usize, duration_secs: f64) {
    FLUSHES_TOTAL.with_label_values(&[driver, status]).inc();
    FLUSHED_OPERATIONS_TOTAL
        .with_label_values(&[driver])
        .inc_by(operations as u64);
    FLUSH_DURATION
        .with_label_values(&[driver])
        .observe(duration_secs);
}

/// Record evicted entries
pub fn record_evictions(driver: &str, evicted: usize) {
    if evicted > 0 {
        EVICTIONS_TOTAL
            .with_label_values(&[driver])
            .inc_by(evicted as u64);
    }
}

/// Update the buffer occupancy gauge
pub fn set_buffer_entries(driver: &str, entries: usize) {
    BUFFER_ENTRIES
        .with_label_values(&[driver])
        .set(entries as i64);
}

/// Record a failed write nobody was waiting on
pub fn record_unattended_failure(driver: &str) {
    UNATTENDED_WRITE_FAILURES.with_label_values(&[driver]).inc();
}
