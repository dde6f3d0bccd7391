//! Prometheus metrics for the sync queue engine.
//!
//! Counters cover the item lifecycle (enqueued, coalesced, synced, failed,
//! dead-lettered, deferred/restored); gauges expose per-store saturation
//! state for the station UI and fleet dashboards; histograms track dispatch
//! batch sizes and delivery latency.

mod helpers;

pub use helpers::{encode_metrics, BackpressureMetrics, DispatchMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "syncq";

lazy_static! {
    // ============================================================================
    // Admission Metrics
    // ============================================================================

    /// Items enqueued, by entity type
    pub static ref SYNC_ENQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_enqueued_total", METRIC_PREFIX),
        "Total items enqueued",
        &["entity_type"]
    ).unwrap();

    /// Enqueues absorbed into an existing pending item
    pub static ref SYNC_COALESCED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_coalesced_total", METRIC_PREFIX),
        "Total enqueues coalesced into an existing pending item"
    ).unwrap();

    /// Items admitted directly into deferred state by the saturation gate
    pub static ref SYNC_ADMISSION_DEFERRED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_admission_deferred_total", METRIC_PREFIX),
        "Total items admitted in deferred state due to backpressure"
    ).unwrap();

    /// Terminal rows removed by retention purges
    pub static ref SYNC_PURGED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_purged_total", METRIC_PREFIX),
        "Total terminal items purged after their retention window"
    ).unwrap();

    // ============================================================================
    // Outcome Metrics
    // ============================================================================

    /// Items marked synced
    pub static ref SYNC_SYNCED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_synced_total", METRIC_PREFIX),
        "Total items successfully synced"
    ).unwrap();

    /// Failed attempts, by error category
    pub static ref SYNC_ATTEMPT_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_attempt_failures_total", METRIC_PREFIX),
        "Total failed sync attempts",
        &["category"]
    ).unwrap();

    /// Items parked in the dead-letter state, by error category
    pub static ref SYNC_DEAD_LETTERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_dead_lettered_total", METRIC_PREFIX),
        "Total items dead-lettered",
        &["category"]
    ).unwrap();

    // ============================================================================
    // Deferral Metrics
    // ============================================================================

    /// Items pushed into deferred state after admission
    pub static ref SYNC_DEFERRED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_deferred_total", METRIC_PREFIX),
        "Total items marked deferred"
    ).unwrap();

    /// Deferred items restored to normal selection
    pub static ref SYNC_RESTORED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_restored_total", METRIC_PREFIX),
        "Total deferred items restored"
    ).unwrap();

    // ============================================================================
    // Per-Store Gauges
    // ============================================================================

    /// Pending items per store
    pub static ref QUEUE_PENDING_ITEMS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_pending_items", METRIC_PREFIX),
        "Pending (unsynced, not dead-lettered) items per store",
        &["store_id"]
    ).unwrap();

    /// Pending payload bytes per store
    pub static ref QUEUE_SIZE_BYTES: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_size_bytes", METRIC_PREFIX),
        "Total pending payload bytes per store",
        &["store_id"]
    ).unwrap();

    /// Deferred items per store
    pub static ref QUEUE_DEFERRED_ITEMS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_deferred_items", METRIC_PREFIX),
        "Deferred items per store",
        &["store_id"]
    ).unwrap();

    /// Saturation gate state per store (1 = saturated)
    pub static ref BACKPRESSURE_SATURATED: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_backpressure_saturated", METRIC_PREFIX),
        "Whether the backpressure gate is closed for a store (1=saturated)",
        &["store_id"]
    ).unwrap();

    // ============================================================================
    // Dispatch Metrics
    // ============================================================================

    /// Items per selected batch
    pub static ref DISPATCH_BATCH_SIZE: Histogram = register_histogram!(
        format!("{}_dispatch_batch_size", METRIC_PREFIX),
        "Number of items selected per dispatch pass",
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0]
    ).unwrap();

    /// Delivery latency per attempt
    pub static ref DELIVERY_LATENCY: Histogram = register_histogram!(
        format!("{}_delivery_latency_seconds", METRIC_PREFIX),
        "Transport delivery latency in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    /// Items skipped because another worker held the claim
    pub static ref DISPATCH_CLAIM_SKIPS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_dispatch_claim_skips_total", METRIC_PREFIX),
        "Total items skipped because they were already claimed"
    ).unwrap();
}
