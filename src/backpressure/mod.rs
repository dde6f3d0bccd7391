//! Backpressure controller: defer, never drop.
//!
//! A saturated store keeps accepting local writes; what changes is their
//! selection order. While the gate is closed, newly-enqueued default
//! priority non-critical push items are admitted in deferred state, and
//! they are restored in bulk once the queue drains below the restore
//! watermarks. Local business mutations are never rejected for queue
//! depth.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::Result;
use crate::metrics::BackpressureMetrics;
use crate::queue::{EntityType, SyncDirection, SyncQueue};

/// Thresholds and cadence for saturation evaluation.
#[derive(Debug, Clone, Deserialize)]
pub struct BackpressureSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Pending-item count that closes the gate
    #[serde(default = "default_max_pending_items")]
    pub max_pending_items: i64,

    /// Pending payload bytes that close the gate
    #[serde(default = "default_max_queue_bytes")]
    pub max_queue_bytes: i64,

    /// Gate reopens only once pending items drain below this watermark
    #[serde(default = "default_restore_pending_items")]
    pub restore_pending_items: i64,

    /// Gate reopens only once pending bytes drain below this watermark
    #[serde(default = "default_restore_queue_bytes")]
    pub restore_queue_bytes: i64,

    /// How often the controller re-evaluates each active store
    #[serde(default = "default_evaluate_interval_secs")]
    pub evaluate_interval_secs: u64,

    /// Entity types that are never deferred (financial close-of-day data
    /// must reach the backend even under saturation)
    #[serde(default = "default_critical_entity_types")]
    pub critical_entity_types: Vec<EntityType>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_pending_items() -> i64 {
    10_000
}

fn default_max_queue_bytes() -> i64 {
    64 * 1024 * 1024
}

fn default_restore_pending_items() -> i64 {
    5_000
}

fn default_restore_queue_bytes() -> i64 {
    32 * 1024 * 1024
}

fn default_evaluate_interval_secs() -> u64 {
    30
}

fn default_critical_entity_types() -> Vec<EntityType> {
    vec![EntityType::DayClose]
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_pending_items: default_max_pending_items(),
            max_queue_bytes: default_max_queue_bytes(),
            restore_pending_items: default_restore_pending_items(),
            restore_queue_bytes: default_restore_queue_bytes(),
            evaluate_interval_secs: default_evaluate_interval_secs(),
            critical_entity_types: default_critical_entity_types(),
        }
    }
}

/// Admission-time view of saturation, shared between the controller and
/// the queue.
///
/// Deferral only ever applies to default-priority, non-critical push
/// items; producer-raised priorities and critical entity types always
/// bypass the gate.
#[derive(Debug)]
pub struct BackpressureGate {
    saturated: DashMap<String, bool>,
    critical: HashSet<EntityType>,
}

impl BackpressureGate {
    pub fn new(critical: impl IntoIterator<Item = EntityType>) -> Self {
        Self {
            saturated: DashMap::new(),
            critical: critical.into_iter().collect(),
        }
    }

    pub fn from_settings(settings: &BackpressureSettings) -> Self {
        Self::new(settings.critical_entity_types.iter().copied())
    }

    /// Whether the gate is currently closed for a store.
    pub fn is_saturated(&self, store_id: &str) -> bool {
        self.saturated.get(store_id).map(|v| *v).unwrap_or(false)
    }

    /// Whether a new item should be admitted in deferred state.
    pub fn should_defer(
        &self,
        store_id: &str,
        entity_type: EntityType,
        priority: i32,
        direction: SyncDirection,
    ) -> bool {
        priority == 0
            && direction == SyncDirection::Push
            && !self.critical.contains(&entity_type)
            && self.is_saturated(store_id)
    }

    fn set_saturated(&self, store_id: &str, saturated: bool) {
        self.saturated.insert(store_id.to_string(), saturated);
    }
}

/// Outcome of one saturation evaluation for a store.
#[derive(Debug, Clone, PartialEq)]
pub enum SaturationState {
    /// Below thresholds; gate open.
    Normal,
    /// Above thresholds (or still above the restore watermarks); gate closed.
    Saturated,
    /// Gate just reopened; deferred items were restored.
    Restored { restored: u64 },
}

/// Background task that evaluates store saturation and orchestrates
/// deferral and restore.
pub struct BackpressureController {
    queue: SyncQueue,
    gate: Arc<BackpressureGate>,
    settings: BackpressureSettings,
    shutdown: broadcast::Receiver<()>,
}

impl BackpressureController {
    pub fn new(
        queue: SyncQueue,
        gate: Arc<BackpressureGate>,
        settings: BackpressureSettings,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            queue,
            gate,
            settings,
            shutdown,
        }
    }

    /// Run periodic evaluation until shutdown.
    pub async fn run(mut self) {
        if !self.settings.enabled {
            info!("backpressure controller disabled");
            return;
        }

        let mut timer =
            tokio::time::interval(Duration::from_secs(self.settings.evaluate_interval_secs));
        // Skip immediate first tick
        timer.tick().await;

        info!(
            interval_secs = self.settings.evaluate_interval_secs,
            max_pending_items = self.settings.max_pending_items,
            max_queue_bytes = self.settings.max_queue_bytes,
            "backpressure controller started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!("backpressure controller received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.evaluate_all().await;
                }
            }
        }

        info!("backpressure controller stopped");
    }

    /// Evaluate every store that still has pending items.
    pub async fn evaluate_all(&self) {
        let stores = match self.queue.active_store_ids().await {
            Ok(stores) => stores,
            Err(e) => {
                warn!(error = %e, "failed to list active stores");
                return;
            }
        };

        for store_id in stores {
            if let Err(e) = self.evaluate_store(&store_id).await {
                warn!(store_id = %store_id, error = %e, "backpressure evaluation failed");
            }
        }
    }

    /// Evaluate one store against the thresholds.
    ///
    /// Entry and exit use different bounds: the gate closes above the max
    /// thresholds but only reopens below the restore watermarks, so a
    /// store hovering near the limit does not flap between states.
    pub async fn evaluate_store(&self, store_id: &str) -> Result<SaturationState> {
        let pending = self.queue.pending_count(store_id).await?;
        let bytes = self.queue.queue_size_bytes(store_id).await?;
        let deferred = self.queue.deferred_count(store_id).await?;
        BackpressureMetrics::update_store(store_id, pending, bytes, deferred);

        let state = if self.gate.is_saturated(store_id) {
            if pending <= self.settings.restore_pending_items
                && bytes <= self.settings.restore_queue_bytes
            {
                self.gate.set_saturated(store_id, false);
                BackpressureMetrics::set_saturated(store_id, false);
                let restored = self.queue.restore_deferred(store_id).await?;
                info!(
                    store_id,
                    pending,
                    bytes,
                    restored,
                    "store drained below restore watermark; deferral lifted"
                );
                SaturationState::Restored { restored }
            } else {
                SaturationState::Saturated
            }
        } else if pending > self.settings.max_pending_items
            || bytes > self.settings.max_queue_bytes
        {
            self.gate.set_saturated(store_id, true);
            BackpressureMetrics::set_saturated(store_id, true);
            warn!(
                store_id,
                pending,
                bytes,
                max_pending_items = self.settings.max_pending_items,
                max_queue_bytes = self.settings.max_queue_bytes,
                "store saturated; new non-critical items will be deferred"
            );
            SaturationState::Saturated
        } else {
            SaturationState::Normal
        };

        Ok(state)
    }
}
