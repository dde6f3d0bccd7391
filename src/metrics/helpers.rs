//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    BACKPRESSURE_SATURATED, DELIVERY_LATENCY, DISPATCH_BATCH_SIZE, DISPATCH_CLAIM_SKIPS_TOTAL,
    QUEUE_DEFERRED_ITEMS, QUEUE_PENDING_ITEMS, QUEUE_SIZE_BYTES,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording dispatch metrics
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record the size of a selected batch
    pub fn record_batch(size: usize) {
        DISPATCH_BATCH_SIZE.observe(size as f64);
    }

    /// Record one delivery attempt's latency
    pub fn record_delivery_latency(seconds: f64) {
        DELIVERY_LATENCY.observe(seconds);
    }

    /// Record an item skipped because it was already claimed
    pub fn record_claim_skip() {
        DISPATCH_CLAIM_SKIPS_TOTAL.inc();
    }
}

/// Helper struct for per-store backpressure gauges
pub struct BackpressureMetrics;

impl BackpressureMetrics {
    /// Update the per-store queue gauges after an evaluation pass
    pub fn update_store(store_id: &str, pending: i64, bytes: i64, deferred: i64) {
        QUEUE_PENDING_ITEMS.with_label_values(&[store_id]).set(pending);
        QUEUE_SIZE_BYTES.with_label_values(&[store_id]).set(bytes);
        QUEUE_DEFERRED_ITEMS.with_label_values(&[store_id]).set(deferred);
    }

    /// Record the saturation gate state for a store
    pub fn set_saturated(store_id: &str, saturated: bool) {
        BACKPRESSURE_SATURATED
            .with_label_values(&[store_id])
            .set(i64::from(saturated));
    }
}
