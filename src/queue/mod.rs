//! Admission and query layer over the sync queue table.
//!
//! [`SyncQueue`] is the only writer of queue rows. Producers enqueue local
//! mutations; the dispatcher pulls retryable batches per (store,
//! entity_type) partition; telemetry reads feed the station UI. Every read
//! and write is scoped by `store_id`, and entity types off the allowlist
//! fail closed to an empty result instead of an error.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::backpressure::BackpressureGate;
use crate::error::{Result, SyncQueueError};
use crate::metrics::{
    SYNC_ADMISSION_DEFERRED_TOTAL, SYNC_COALESCED_TOTAL, SYNC_DEFERRED_TOTAL,
    SYNC_ENQUEUED_TOTAL, SYNC_PURGED_TOTAL, SYNC_RESTORED_TOTAL,
};

pub mod outcome;
pub mod types;

pub use outcome::{
    classify_failure, compute_backoff, AttemptFailure, AttemptOutcome, DeadLetterRequest,
    RetryPolicy,
};
pub use types::{
    EntityType, ErrorCategory, NewQueueItem, QueueItem, SyncDirection, SyncOperation,
    DEFAULT_MAX_ATTEMPTS, DEFERRED_PRIORITY,
};

/// Column list shared by every full-item read.
const ITEM_COLUMNS: &str = "id, store_id, entity_type, entity_id, operation, payload, \
     priority, deferred, synced, sync_attempts, max_attempts, \
     last_sync_error, last_attempt_at, error_category, retry_after, \
     dead_lettered, dead_letter_reason, dead_lettered_at, \
     sync_direction, idempotency_key, api_endpoint, http_status, \
     response_body, created_at, synced_at";

/// Durable sync queue scoped to one local database.
///
/// Cheap to clone; the pool is internally reference-counted.
#[derive(Clone)]
pub struct SyncQueue {
    pool: SqlitePool,
    retry_policy: RetryPolicy,
    gate: Option<Arc<BackpressureGate>>,
}

impl SyncQueue {
    pub fn new(pool: SqlitePool, retry_policy: RetryPolicy) -> Self {
        Self {
            pool,
            retry_policy,
            gate: None,
        }
    }

    /// Queue that consults a backpressure gate at admission time.
    pub fn with_gate(
        pool: SqlitePool,
        retry_policy: RetryPolicy,
        gate: Arc<BackpressureGate>,
    ) -> Self {
        Self {
            pool,
            retry_policy,
            gate: Some(gate),
        }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Persist a local mutation.
    ///
    /// Never rejects a write because of queue depth: when the store is
    /// saturated, eligible items are admitted in deferred state instead.
    /// Only malformed input (empty store_id or entity_id, negative
    /// priority) is refused.
    #[instrument(skip(self, item), fields(
        store_id = %item.store_id,
        entity_type = %item.entity_type,
        operation = %item.operation,
    ))]
    pub async fn enqueue(&self, item: NewQueueItem) -> Result<QueueItem> {
        validate_new_item(&item)?;

        let deferred = self.gate.as_ref().is_some_and(|gate| {
            gate.should_defer(
                &item.store_id,
                item.entity_type,
                item.priority,
                item.sync_direction,
            )
        });
        let priority = if deferred { DEFERRED_PRIORITY } else { item.priority };
        let max_attempts = item.max_attempts.unwrap_or(self.retry_policy.max_attempts);

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let payload_text = serde_json::to_string(&item.payload)?;

        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                id, store_id, entity_type, entity_id, operation, payload,
                priority, deferred, synced, sync_attempts, max_attempts,
                dead_lettered, sync_direction, idempotency_key, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, ?9, 0, ?10, ?11, ?12)
            "#,
        )
        .bind(id.to_string())
        .bind(&item.store_id)
        .bind(item.entity_type.as_str())
        .bind(&item.entity_id)
        .bind(item.operation.as_str())
        .bind(&payload_text)
        .bind(priority)
        .bind(deferred)
        .bind(max_attempts)
        .bind(item.sync_direction.as_str())
        .bind(&item.idempotency_key)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        SYNC_ENQUEUED_TOTAL
            .with_label_values(&[item.entity_type.as_str()])
            .inc();
        if deferred {
            SYNC_ADMISSION_DEFERRED_TOTAL.inc();
            debug!(item_id = %id, "store saturated; item admitted deferred");
        }

        Ok(QueueItem {
            id,
            store_id: item.store_id,
            entity_type: item.entity_type,
            entity_id: item.entity_id,
            operation: item.operation,
            payload: item.payload,
            priority,
            deferred,
            synced: false,
            sync_attempts: 0,
            max_attempts,
            last_sync_error: None,
            last_attempt_at: None,
            error_category: None,
            retry_after: None,
            dead_lettered: false,
            dead_letter_reason: None,
            dead_lettered_at: None,
            sync_direction: item.sync_direction,
            idempotency_key: item.idempotency_key,
            api_endpoint: None,
            http_status: None,
            response_body: None,
            created_at,
            synced_at: None,
        })
    }

    /// Enqueue, collapsing into an existing pending item for the same
    /// (store, entity_type, entity_id, operation) when one exists.
    ///
    /// Rapid successive edits to the same entity then sync once with the
    /// latest payload instead of as a burst of stale writes.
    pub async fn enqueue_coalescing(&self, item: NewQueueItem) -> Result<QueueItem> {
        validate_new_item(&item)?;

        let existing = self
            .find_pending_by_entity(
                &item.store_id,
                item.entity_type,
                &item.entity_id,
                item.operation,
            )
            .await?;

        if let Some(found) = existing {
            // The guarded write refuses rows that went terminal since the
            // read above; a mark_synced landing in between cannot swallow
            // the new payload onto a synced row.
            if self.update_payload(found.id, &item.payload).await? {
                SYNC_COALESCED_TOTAL.inc();
                debug!(
                    item_id = %found.id,
                    store_id = %item.store_id,
                    entity_type = %item.entity_type,
                    "coalesced payload into pending item"
                );

                return Ok(QueueItem {
                    payload: item.payload,
                    ..found
                });
            }
        }

        self.enqueue(item).await
    }

    /// Fetch one item regardless of state.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<QueueItem>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_item).transpose()
    }

    /// Most recent pending item for a logical entity, if any. Used by
    /// coalescing and by producers that need to inspect in-flight state.
    pub async fn find_pending_by_entity(
        &self,
        store_id: &str,
        entity_type: EntityType,
        entity_id: &str,
        operation: SyncOperation,
    ) -> Result<Option<QueueItem>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue \
             WHERE store_id = ?1 AND entity_type = ?2 AND entity_id = ?3 \
               AND operation = ?4 AND synced = 0 AND dead_lettered = 0 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(store_id)
        .bind(entity_type.as_str())
        .bind(entity_id)
        .bind(operation.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_item).transpose()
    }

    /// Replace the payload of a pending item. Returns `false` when the item
    /// is missing or already terminal.
    pub async fn update_payload(&self, id: Uuid, payload: &serde_json::Value) -> Result<bool> {
        let payload_text = serde_json::to_string(payload)?;
        let result = sqlx::query(
            "UPDATE sync_queue SET payload = ?2 \
             WHERE id = ?1 AND synced = 0 AND dead_lettered = 0",
        )
        .bind(id.to_string())
        .bind(&payload_text)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Retryable batch for one partition, with the entity type as a raw
    /// string. Unknown types return an empty batch, so callers outside the
    /// crate (IPC from the station UI) cannot turn a typo into a scan.
    pub async fn retryable_batch(
        &self,
        store_id: &str,
        entity_type: &str,
        limit: i64,
    ) -> Result<Vec<QueueItem>> {
        match EntityType::parse(entity_type) {
            Some(parsed) => self.retryable_batch_typed(store_id, parsed, limit).await,
            None => {
                warn!(store_id, entity_type, "entity type not on allowlist; empty batch");
                Ok(Vec::new())
            }
        }
    }

    /// Retryable batch for one partition.
    ///
    /// Selects pending push items whose backoff window has elapsed, ordered
    /// by priority (descending) then enqueue time, with deferred items
    /// sorting after everything else.
    #[instrument(skip(self), fields(store_id = %store_id, entity_type = %entity_type))]
    pub async fn retryable_batch_typed(
        &self,
        store_id: &str,
        entity_type: EntityType,
        limit: i64,
    ) -> Result<Vec<QueueItem>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue \
             WHERE store_id = ?1 AND entity_type = ?2 \
               AND synced = 0 AND dead_lettered = 0 \
               AND sync_direction = 'push' \
               AND (retry_after IS NULL OR retry_after <= ?3) \
             ORDER BY deferred ASC, priority DESC, created_at ASC \
             LIMIT ?4"
        ))
        .bind(store_id)
        .bind(entity_type.as_str())
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let items = rows.iter().map(row_to_item).collect::<Result<Vec<_>>>()?;
        debug!(count = items.len(), "selected retryable batch");
        Ok(items)
    }

    /// Pending item count per entity type for one store. Types with no
    /// pending items are absent from the map.
    pub async fn partition_depths(&self, store_id: &str) -> Result<HashMap<EntityType, i64>> {
        let rows = sqlx::query(
            "SELECT entity_type, COUNT(*) AS depth FROM sync_queue \
             WHERE store_id = ?1 AND synced = 0 AND dead_lettered = 0 \
             GROUP BY entity_type",
        )
        .bind(store_id)
        .fetch_all(&self.pool)
        .await?;

        let mut depths = HashMap::new();
        for row in rows {
            let name: String = row.try_get("entity_type")?;
            // A name off the allowlist means an external writer touched the
            // table; skip it rather than fail the whole read.
            match EntityType::parse(&name) {
                Some(entity_type) => {
                    depths.insert(entity_type, row.try_get("depth")?);
                }
                None => {
                    warn!(store_id, entity_type = %name, "ignoring rows with unknown entity type");
                }
            }
        }
        Ok(depths)
    }

    /// Total pending (unsynced, not dead-lettered) items for one store.
    pub async fn pending_count(&self, store_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sync_queue \
             WHERE store_id = ?1 AND synced = 0 AND dead_lettered = 0",
        )
        .bind(store_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Sum of pending payload sizes in bytes for one store.
    pub async fn queue_size_bytes(&self, store_id: &str) -> Result<i64> {
        let bytes = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(LENGTH(CAST(payload AS BLOB))), 0) FROM sync_queue \
             WHERE store_id = ?1 AND synced = 0 AND dead_lettered = 0",
        )
        .bind(store_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(bytes)
    }

    /// Enqueue time of the oldest pending item, or `None` when nothing is
    /// pending. Drives the "unsynced since" banner on the station UI.
    pub async fn oldest_pending_timestamp(
        &self,
        store_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let oldest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MIN(created_at) FROM sync_queue \
             WHERE store_id = ?1 AND synced = 0 AND dead_lettered = 0",
        )
        .bind(store_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(oldest)
    }

    /// Pending items currently deferred by backpressure.
    pub async fn deferred_count(&self, store_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sync_queue \
             WHERE store_id = ?1 AND deferred = 1 AND synced = 0 AND dead_lettered = 0",
        )
        .bind(store_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Items parked in the dead-letter state for one store.
    pub async fn dead_lettered_count(&self, store_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sync_queue WHERE store_id = ?1 AND dead_lettered = 1",
        )
        .bind(store_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Dead-lettered items for operator review, newest first.
    pub async fn dead_lettered_items(
        &self,
        store_id: &str,
        limit: i64,
    ) -> Result<Vec<QueueItem>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue \
             WHERE store_id = ?1 AND dead_lettered = 1 \
             ORDER BY dead_lettered_at DESC LIMIT ?2"
        ))
        .bind(store_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }

    /// Push a pending item into deferred state. Writes the sentinel
    /// priority so readers that only know the legacy encoding still order
    /// it last. Terminal items are left untouched.
    pub async fn mark_deferred(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sync_queue SET deferred = 1, priority = ?2 \
             WHERE id = ?1 AND synced = 0 AND dead_lettered = 0",
        )
        .bind(id.to_string())
        .bind(DEFERRED_PRIORITY)
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            SYNC_DEFERRED_TOTAL.inc();
        }
        Ok(changed)
    }

    /// Lift deferral for every deferred item in a store, restoring default
    /// priority. Returns how many items were restored.
    #[instrument(skip(self), fields(store_id = %store_id))]
    pub async fn restore_deferred(&self, store_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_queue SET deferred = 0, priority = 0 \
             WHERE store_id = ?1 AND deferred = 1 AND synced = 0 AND dead_lettered = 0",
        )
        .bind(store_id)
        .execute(&self.pool)
        .await?;

        let restored = result.rows_affected();
        if restored > 0 {
            SYNC_RESTORED_TOTAL.inc_by(restored);
            debug!(restored, "restored deferred items");
        }
        Ok(restored)
    }

    /// Stores that still have pending items. Drives the backpressure
    /// evaluation loop.
    pub async fn active_store_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT store_id FROM sync_queue \
             WHERE synced = 0 AND dead_lettered = 0 ORDER BY store_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Delete terminal rows (synced or dead-lettered) that reached the end
    /// of their retention window. Returns how many rows were removed.
    pub async fn purge_terminal(
        &self,
        store_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM sync_queue WHERE store_id = ?1 AND ( \
               (synced = 1 AND synced_at <= ?2) OR \
               (dead_lettered = 1 AND dead_lettered_at <= ?2))",
        )
        .bind(store_id)
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            SYNC_PURGED_TOTAL.inc_by(purged);
            debug!(store_id, purged, "purged terminal items");
        }
        Ok(purged)
    }
}

fn validate_new_item(item: &NewQueueItem) -> Result<()> {
    if item.store_id.trim().is_empty() {
        return Err(SyncQueueError::Validation(
            "store_id must not be empty".to_string(),
        ));
    }
    if item.entity_id.trim().is_empty() {
        return Err(SyncQueueError::Validation(
            "entity_id must not be empty".to_string(),
        ));
    }
    if item.priority < 0 {
        return Err(SyncQueueError::Validation(format!(
            "priority {} is invalid; negative priority is reserved for deferred items",
            item.priority
        )));
    }
    if let Some(max_attempts) = item.max_attempts {
        if max_attempts < 1 {
            return Err(SyncQueueError::Validation(format!(
                "max_attempts {max_attempts} must be at least 1"
            )));
        }
    }
    Ok(())
}

pub(crate) fn row_to_item(row: &SqliteRow) -> Result<QueueItem> {
    let id_text: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id_text)
        .map_err(|e| SyncQueueError::Decode(format!("bad item id {id_text}: {e}")))?;

    let entity_type_text: String = row.try_get("entity_type")?;
    let entity_type = EntityType::parse(&entity_type_text).ok_or_else(|| {
        SyncQueueError::Decode(format!("entity type {entity_type_text} not on allowlist"))
    })?;

    let operation_text: String = row.try_get("operation")?;
    let operation = SyncOperation::parse(&operation_text)
        .ok_or_else(|| SyncQueueError::Decode(format!("unknown operation {operation_text}")))?;

    let direction_text: String = row.try_get("sync_direction")?;
    let sync_direction = SyncDirection::parse(&direction_text).ok_or_else(|| {
        SyncQueueError::Decode(format!("unknown sync direction {direction_text}"))
    })?;

    let payload_text: String = row.try_get("payload")?;
    let payload = serde_json::from_str(&payload_text)?;

    let error_category = row
        .try_get::<Option<String>, _>("error_category")?
        .map(|s| {
            ErrorCategory::parse(&s)
                .ok_or_else(|| SyncQueueError::Decode(format!("unknown error category {s}")))
        })
        .transpose()?;

    Ok(QueueItem {
        id,
        store_id: row.try_get("store_id")?,
        entity_type,
        entity_id: row.try_get("entity_id")?,
        operation,
        payload,
        priority: row.try_get("priority")?,
        deferred: row.try_get("deferred")?,
        synced: row.try_get("synced")?,
        sync_attempts: row.try_get("sync_attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        last_sync_error: row.try_get("last_sync_error")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        error_category,
        retry_after: row.try_get("retry_after")?,
        dead_lettered: row.try_get("dead_lettered")?,
        dead_letter_reason: row.try_get("dead_letter_reason")?,
        dead_lettered_at: row.try_get("dead_lettered_at")?,
        sync_direction,
        idempotency_key: row.try_get("idempotency_key")?,
        api_endpoint: row.try_get("api_endpoint")?,
        http_status: row.try_get("http_status")?,
        response_body: row.try_get("response_body")?,
        created_at: row.try_get("created_at")?,
        synced_at: row.try_get("synced_at")?,
    })
}
