//! Push dispatcher: drains retryable push items per (store, entity type)
//! partition and reports each attempt's outcome back to the queue.
//!
//! Delivery itself happens behind the [`SyncTransport`] seam so stations
//! can plug in their own HTTP client. The dispatcher owns batch selection
//! order, in-flight claims, per-attempt timeouts and outcome bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::DispatchMetrics;
use crate::queue::{AttemptFailure, AttemptOutcome, EntityType, QueueItem, SyncQueue};

/// Successful delivery acknowledgment from the transport.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReceipt {
    /// HTTP status returned by the backend, when known
    pub http_status: Option<u16>,
}

/// Delivery seam between the queue engine and the station's HTTP client.
///
/// One call performs one delivery attempt for one item. Returning `Ok`
/// means the backend accepted the item; any failure (including a non-2xx
/// response) comes back as an [`AttemptFailure`] carrying the status and
/// body when one was received, so the outcome tracker can classify it.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn deliver(
        &self,
        item: &QueueItem,
    ) -> std::result::Result<DeliveryReceipt, AttemptFailure>;
}

/// Polling cadence and per-attempt limits for the dispatch loop.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    /// Items selected per partition per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Delay between drain passes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Ceiling on a single delivery attempt
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Random delay added before each pass so co-located stations do not
    /// poll the backend in lockstep
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_batch_size() -> i64 {
    25
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    250
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

/// Outcome of one drain pass over a single partition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassSummary {
    /// Items for which a delivery attempt was made
    pub attempted: usize,
    /// Items acknowledged and marked synced
    pub synced: usize,
    /// Items that failed and were rescheduled behind a backoff window
    pub retried: usize,
    /// Items that exhausted retries or failed non-retryably
    pub dead_lettered: usize,
    /// Items skipped because another pass already claimed or finished them
    pub skipped: usize,
}

/// Statistics for the sync dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Total drain passes executed
    pub total_passes: AtomicU64,
    /// Total delivery attempts
    pub total_attempted: AtomicU64,
    /// Total items marked synced
    pub total_synced: AtomicU64,
    /// Total items rescheduled for retry
    pub total_retried: AtomicU64,
    /// Total items dead-lettered
    pub total_dead_lettered: AtomicU64,
    /// Total items skipped due to an existing in-flight claim
    pub total_claim_skips: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            total_passes: self.total_passes.load(Ordering::Relaxed),
            total_attempted: self.total_attempted.load(Ordering::Relaxed),
            total_synced: self.total_synced.load(Ordering::Relaxed),
            total_retried: self.total_retried.load(Ordering::Relaxed),
            total_dead_lettered: self.total_dead_lettered.load(Ordering::Relaxed),
            total_claim_skips: self.total_claim_skips.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub total_passes: u64,
    pub total_attempted: u64,
    pub total_synced: u64,
    pub total_retried: u64,
    pub total_dead_lettered: u64,
    pub total_claim_skips: u64,
}

enum ItemDisposition {
    Synced,
    Failed(AttemptOutcome),
}

/// Drains pending push items and records their outcomes.
#[derive(Clone)]
pub struct Dispatcher {
    queue: SyncQueue,
    transport: Arc<dyn SyncTransport>,
    settings: DispatchSettings,
    in_flight: Arc<DashSet<Uuid>>,
    stats: Arc<DispatcherStats>,
}

impl Dispatcher {
    pub fn new(
        queue: SyncQueue,
        transport: Arc<dyn SyncTransport>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            queue,
            transport,
            settings,
            in_flight: Arc::new(DashSet::new()),
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    /// Get dispatcher statistics
    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of items currently claimed by a running attempt.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Run drain passes until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut timer =
            tokio::time::interval(Duration::from_millis(self.settings.poll_interval_ms));
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            poll_interval_ms = self.settings.poll_interval_ms,
            batch_size = self.settings.batch_size,
            "sync dispatcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("sync dispatcher received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    if self.settings.jitter_ms > 0 {
                        let jitter = rand::rng().random_range(0..=self.settings.jitter_ms);
                        tokio::time::sleep(Duration::from_millis(jitter)).await;
                    }
                    self.drain_all().await;
                }
            }
        }

        tracing::info!("sync dispatcher stopped");
    }

    /// Drain every partition of every store with pending items. Stores
    /// are drained concurrently; one slow store cannot starve the rest of
    /// a pass.
    pub async fn drain_all(&self) {
        let stores = match self.queue.active_store_ids().await {
            Ok(stores) => stores,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list active stores");
                return;
            }
        };

        join_all(stores.iter().map(|store_id| async move {
            if let Err(e) = self.drain_store(store_id).await {
                tracing::warn!(store_id = %store_id, error = %e, "store drain failed");
            }
        }))
        .await;
    }

    /// Drain every entity-type partition of one store.
    ///
    /// Partitions are independent and are drained concurrently, so a
    /// partition stuck on hanging deliveries never holds up the others'
    /// items within the same pass.
    pub async fn drain_store(&self, store_id: &str) -> Result<PassSummary> {
        let passes = join_all(
            EntityType::ALL
                .iter()
                .map(|entity_type| self.drain_partition(store_id, *entity_type)),
        )
        .await;

        let mut total = PassSummary::default();
        for pass in passes {
            let pass = pass?;
            total.attempted += pass.attempted;
            total.synced += pass.synced;
            total.retried += pass.retried;
            total.dead_lettered += pass.dead_lettered;
            total.skipped += pass.skipped;
        }
        Ok(total)
    }

    /// Drain one (store, entity type) partition: select the retryable
    /// batch in queue order and attempt each item in turn.
    #[tracing::instrument(
        name = "dispatcher.drain_partition",
        skip(self),
        fields(store_id = %store_id, entity_type = %entity_type)
    )]
    pub async fn drain_partition(
        &self,
        store_id: &str,
        entity_type: EntityType,
    ) -> Result<PassSummary> {
        let batch = self
            .queue
            .retryable_batch_typed(store_id, entity_type, self.settings.batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(PassSummary::default());
        }

        DispatchMetrics::record_batch(batch.len());
        let mut summary = PassSummary::default();

        for item in batch {
            if !self.in_flight.insert(item.id) {
                summary.skipped += 1;
                self.stats.total_claim_skips.fetch_add(1, Ordering::Relaxed);
                DispatchMetrics::record_claim_skip();
                continue;
            }

            // The batch can be stale by the time the claim lands: a
            // concurrent pass may have finished this item between selection
            // and now. Outcomes are persisted before a claim is released,
            // so a re-read under our claim sees the final state.
            let current = match self.queue.find_by_id(item.id).await {
                Ok(Some(current))
                    if current.is_pending() && current.is_retry_due(Utc::now()) =>
                {
                    current
                }
                Ok(_) => {
                    self.in_flight.remove(&item.id);
                    summary.skipped += 1;
                    self.stats.total_claim_skips.fetch_add(1, Ordering::Relaxed);
                    DispatchMetrics::record_claim_skip();
                    continue;
                }
                Err(e) => {
                    self.in_flight.remove(&item.id);
                    return Err(e);
                }
            };

            summary.attempted += 1;
            let disposition = self.attempt(&current).await;
            // The claim is released on every path, including storage errors.
            self.in_flight.remove(&item.id);

            match disposition? {
                ItemDisposition::Synced => summary.synced += 1,
                ItemDisposition::Failed(AttemptOutcome::Retrying { .. }) => summary.retried += 1,
                ItemDisposition::Failed(AttemptOutcome::DeadLettered { .. }) => {
                    summary.dead_lettered += 1
                }
                ItemDisposition::Failed(AttemptOutcome::AlreadyTerminal) => summary.skipped += 1,
            }
        }

        // Update stats
        self.stats.total_passes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_attempted
            .fetch_add(summary.attempted as u64, Ordering::Relaxed);
        self.stats
            .total_synced
            .fetch_add(summary.synced as u64, Ordering::Relaxed);
        self.stats
            .total_retried
            .fetch_add(summary.retried as u64, Ordering::Relaxed);
        self.stats
            .total_dead_lettered
            .fetch_add(summary.dead_lettered as u64, Ordering::Relaxed);

        tracing::debug!(
            attempted = summary.attempted,
            synced = summary.synced,
            retried = summary.retried,
            dead_lettered = summary.dead_lettered,
            skipped = summary.skipped,
            "drain pass complete"
        );

        Ok(summary)
    }

    /// One delivery attempt for one claimed item.
    async fn attempt(&self, item: &QueueItem) -> Result<ItemDisposition> {
        let deadline = Duration::from_millis(self.settings.delivery_timeout_ms);
        let started = Instant::now();
        let delivery = tokio::time::timeout(deadline, self.transport.deliver(item)).await;
        DispatchMetrics::record_delivery_latency(started.elapsed().as_secs_f64());

        match delivery {
            Ok(Ok(receipt)) => {
                self.queue.mark_synced(item.id).await?;
                tracing::debug!(
                    id = %item.id,
                    entity_id = %item.entity_id,
                    http_status = ?receipt.http_status,
                    "item delivered"
                );
                Ok(ItemDisposition::Synced)
            }
            Ok(Err(failure)) => {
                let outcome = self.queue.increment_attempts(item.id, failure).await?;
                Ok(ItemDisposition::Failed(outcome))
            }
            Err(_) => {
                let mut failure = AttemptFailure::timeout(self.settings.delivery_timeout_ms);
                if let Some(endpoint) = &item.api_endpoint {
                    failure = failure.endpoint(endpoint.as_str());
                }
                let outcome = self.queue.increment_attempts(item.id, failure).await?;
                Ok(ItemDisposition::Failed(outcome))
            }
        }
    }
}
