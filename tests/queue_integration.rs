//! Queue admission, selection, outcome, and housekeeping tests
//!
//! Every test runs against a real SQLite file in a fresh tempdir, the
//! same way a station runs the engine against its local database.

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use pos_sync_queue::error::SyncQueueError;
use pos_sync_queue::queue::{
    AttemptFailure, AttemptOutcome, DeadLetterRequest, EntityType, ErrorCategory, NewQueueItem,
    RetryPolicy, SyncDirection, SyncOperation, SyncQueue, DEFERRED_PRIORITY,
};
use pos_sync_queue::store::{self, StoreConfig};
use tempfile::TempDir;

const STORE_A: &str = "store-001";
const STORE_B: &str = "store-002";

/// Open a queue with the default retry policy against a fresh database.
async fn open_queue() -> (SyncQueue, TempDir) {
    open_queue_with_policy(RetryPolicy::default()).await
}

async fn open_queue_with_policy(policy: RetryPolicy) -> (SyncQueue, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let config = StoreConfig::with_database_path(dir.path().join("sync_queue.db"));
    let pool = store::open(&config).await.expect("open store");
    (SyncQueue::new(pool, policy), dir)
}

/// Policy whose backoff windows elapse immediately, so a failed item is
/// selectable again on the next pass.
fn zero_delay_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay_secs: 0,
        max_delay_secs: 0,
        ..RetryPolicy::default()
    }
}

fn pack_item(store_id: &str, entity_id: &str) -> NewQueueItem {
    NewQueueItem::new(
        store_id,
        EntityType::Pack,
        entity_id,
        SyncOperation::Create,
        json!({"pack_number": entity_id, "game_code": "G-100"}),
    )
}

fn item_of(store_id: &str, entity_type: EntityType, entity_id: &str) -> NewQueueItem {
    NewQueueItem::new(
        store_id,
        entity_type,
        entity_id,
        SyncOperation::Create,
        json!({"entity_id": entity_id}),
    )
}

// =============================================================================
// Admission
// =============================================================================

mod admission_tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_sets_lifecycle_defaults() {
        let (queue, _dir) = open_queue().await;

        let item = queue.enqueue(pack_item(STORE_A, "pack-100")).await.unwrap();

        assert_ne!(item.id, Uuid::nil());
        assert!(!item.synced);
        assert!(!item.dead_lettered);
        assert!(!item.deferred);
        assert_eq!(item.sync_attempts, 0);
        assert_eq!(item.max_attempts, 5);
        assert_eq!(item.priority, 0);
        assert_eq!(item.sync_direction, SyncDirection::Push);
        assert!(item.retry_after.is_none());
        assert!(item.is_pending());

        // Round-trip through the database.
        let found = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(found.id, item.id);
        assert_eq!(found.store_id, STORE_A);
        assert_eq!(found.entity_type, EntityType::Pack);
        assert_eq!(found.entity_id, "pack-100");
        assert_eq!(found.operation, SyncOperation::Create);
        assert_eq!(found.payload, json!({"pack_number": "pack-100", "game_code": "G-100"}));
        assert_eq!(found.max_attempts, 5);
    }

    #[tokio::test]
    async fn test_enqueue_honors_builder_overrides() {
        let (queue, _dir) = open_queue().await;

        let item = queue
            .enqueue(
                pack_item(STORE_A, "pack-101")
                    .priority(7)
                    .direction(SyncDirection::Pull)
                    .idempotency_key("store-001:pack:pack-101:create")
                    .max_attempts(3),
            )
            .await
            .unwrap();

        let found = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(found.priority, 7);
        assert_eq!(found.sync_direction, SyncDirection::Pull);
        assert_eq!(
            found.idempotency_key.as_deref(),
            Some("store-001:pack:pack-101:create")
        );
        assert_eq!(found.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_store_id() {
        let (queue, _dir) = open_queue().await;

        let err = queue.enqueue(pack_item("", "pack-1")).await.unwrap_err();
        assert!(matches!(err, SyncQueueError::Validation(_)));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_negative_priority() {
        let (queue, _dir) = open_queue().await;

        let err = queue
            .enqueue(pack_item(STORE_A, "pack-1").priority(-1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncQueueError::Validation(_)));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_non_positive_max_attempts() {
        let (queue, _dir) = open_queue().await;

        let err = queue
            .enqueue(pack_item(STORE_A, "pack-1").max_attempts(0))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncQueueError::Validation(_)));
    }

    #[tokio::test]
    async fn test_coalescing_updates_pending_payload_in_place() {
        let (queue, _dir) = open_queue().await;

        let first = queue
            .enqueue_coalescing(NewQueueItem::new(
                STORE_A,
                EntityType::Shift,
                "shift-42",
                SyncOperation::Update,
                json!({"ticket_count": 10}),
            ))
            .await
            .unwrap();
        let second = queue
            .enqueue_coalescing(NewQueueItem::new(
                STORE_A,
                EntityType::Shift,
                "shift-42",
                SyncOperation::Update,
                json!({"ticket_count": 25}),
            ))
            .await
            .unwrap();

        // Same row, replaced payload, still a single pending item.
        assert_eq!(second.id, first.id);
        assert_eq!(second.payload, json!({"ticket_count": 25}));
        assert_eq!(queue.pending_count(STORE_A).await.unwrap(), 1);

        let found = queue.find_by_id(first.id).await.unwrap().unwrap();
        assert_eq!(found.payload, json!({"ticket_count": 25}));

        // A different operation on the same entity is not coalesced.
        let delete = queue
            .enqueue_coalescing(NewQueueItem::new(
                STORE_A,
                EntityType::Shift,
                "shift-42",
                SyncOperation::Delete,
                json!({}),
            ))
            .await
            .unwrap();
        assert_ne!(delete.id, first.id);
        assert_eq!(queue.pending_count(STORE_A).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_coalescing_after_terminal_inserts_fresh_row() {
        let (queue, _dir) = open_queue().await;

        let first = queue
            .enqueue_coalescing(pack_item(STORE_A, "pack-7"))
            .await
            .unwrap();
        assert!(queue.mark_synced(first.id).await.unwrap());

        let second = queue
            .enqueue_coalescing(pack_item(STORE_A, "pack-7"))
            .await
            .unwrap();

        assert_ne!(second.id, first.id);
        assert_eq!(queue.pending_count(STORE_A).await.unwrap(), 1);
        // The synced row is untouched history.
        let old = queue.find_by_id(first.id).await.unwrap().unwrap();
        assert!(old.synced);
    }

    #[tokio::test]
    async fn test_coalescing_survives_sync_between_read_and_write() {
        let (queue, _dir) = open_queue().await;

        let first = queue
            .enqueue_coalescing(NewQueueItem::new(
                STORE_A,
                EntityType::Shift,
                "shift-9",
                SyncOperation::Update,
                json!({"ticket_count": 10}),
            ))
            .await
            .unwrap();

        // The interleaving a concurrent dispatcher can produce: coalescing
        // reads the pending row, then the delivery confirmation lands
        // before the payload write.
        let stale = queue
            .find_pending_by_entity(STORE_A, EntityType::Shift, "shift-9", SyncOperation::Update)
            .await
            .unwrap()
            .expect("pending row");
        assert!(queue.mark_synced(stale.id).await.unwrap());

        // The payload write refuses the now-terminal row...
        assert!(!queue
            .update_payload(stale.id, &json!({"ticket_count": 25}))
            .await
            .unwrap());

        // ...so the mutation lands on a fresh pending row instead of
        // being silently written onto delivered history.
        let second = queue
            .enqueue_coalescing(NewQueueItem::new(
                STORE_A,
                EntityType::Shift,
                "shift-9",
                SyncOperation::Update,
                json!({"ticket_count": 25}),
            ))
            .await
            .unwrap();

        assert_ne!(second.id, first.id);
        assert!(second.is_pending());
        assert_eq!(second.payload, json!({"ticket_count": 25}));
        assert_eq!(queue.pending_count(STORE_A).await.unwrap(), 1);

        // The synced row still carries exactly what was delivered.
        let synced = queue.find_by_id(first.id).await.unwrap().unwrap();
        assert!(synced.synced);
        assert_eq!(synced.payload, json!({"ticket_count": 10}));
    }

    #[tokio::test]
    async fn test_update_payload_only_touches_pending_items() {
        let (queue, _dir) = open_queue().await;

        let item = queue.enqueue(pack_item(STORE_A, "pack-9")).await.unwrap();
        assert!(queue
            .update_payload(item.id, &json!({"pack_number": "pack-9", "status": "activated"}))
            .await
            .unwrap());

        queue.mark_synced(item.id).await.unwrap();
        assert!(!queue
            .update_payload(item.id, &json!({"status": "tampered"}))
            .await
            .unwrap());

        let found = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(found.payload["status"], "activated");
    }
}

// =============================================================================
// Selection
// =============================================================================

mod selection_tests {
    use super::*;

    #[tokio::test]
    async fn test_selection_isolated_per_store() {
        let (queue, _dir) = open_queue().await;

        for n in 0..3 {
            queue
                .enqueue(pack_item(STORE_A, &format!("a-{n}")))
                .await
                .unwrap();
        }
        for n in 0..2 {
            queue
                .enqueue(pack_item(STORE_B, &format!("b-{n}")))
                .await
                .unwrap();
        }

        let batch_a = queue
            .retryable_batch(STORE_A, "pack", 100)
            .await
            .unwrap();
        let batch_b = queue
            .retryable_batch(STORE_B, "pack", 100)
            .await
            .unwrap();

        assert_eq!(batch_a.len(), 3);
        assert!(batch_a.iter().all(|i| i.store_id == STORE_A));
        assert_eq!(batch_b.len(), 2);
        assert!(batch_b.iter().all(|i| i.store_id == STORE_B));
    }

    #[tokio::test]
    async fn test_selection_priority_desc_then_created_at_asc() {
        let (queue, _dir) = open_queue().await;

        queue
            .enqueue(pack_item(STORE_A, "low-first"))
            .await
            .unwrap();
        queue
            .enqueue(pack_item(STORE_A, "urgent-first").priority(10))
            .await
            .unwrap();
        queue
            .enqueue(pack_item(STORE_A, "mid").priority(5))
            .await
            .unwrap();
        queue
            .enqueue(pack_item(STORE_A, "urgent-second").priority(10))
            .await
            .unwrap();

        let batch = queue.retryable_batch(STORE_A, "pack", 10).await.unwrap();
        let order: Vec<&str> = batch.iter().map(|i| i.entity_id.as_str()).collect();

        assert_eq!(order, vec!["urgent-first", "urgent-second", "mid", "low-first"]);
    }

    #[tokio::test]
    async fn test_selection_bounded_by_limit() {
        let (queue, _dir) = open_queue().await;

        // 190 normal items, then 10 high-priority stragglers.
        for n in 0..190 {
            queue
                .enqueue(pack_item(STORE_A, &format!("pack-{n:03}")))
                .await
                .unwrap();
        }
        for n in 0..10 {
            queue
                .enqueue(pack_item(STORE_A, &format!("hot-{n}")).priority(5))
                .await
                .unwrap();
        }

        let batch = queue.retryable_batch(STORE_A, "pack", 50).await.unwrap();

        assert_eq!(batch.len(), 50);
        // High-priority items lead even though they were enqueued last.
        for (n, item) in batch.iter().take(10).enumerate() {
            assert_eq!(item.entity_id, format!("hot-{n}"));
        }
        // The remainder is the oldest normal items in FIFO order.
        for (n, item) in batch.iter().skip(10).enumerate() {
            assert_eq!(item.entity_id, format!("pack-{n:03}"));
        }
    }

    #[tokio::test]
    async fn test_selection_fails_closed_on_unknown_entity_type() {
        let (queue, _dir) = open_queue().await;
        queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();

        for bogus in [
            "malicious_type",
            "PACK",
            "",
            "pack; DROP TABLE sync_queue",
        ] {
            let batch = queue.retryable_batch(STORE_A, bogus, 10).await.unwrap();
            assert!(batch.is_empty(), "{bogus:?} must select nothing");
        }

        // The table is intact and real selections still work.
        let batch = queue.retryable_batch(STORE_A, "pack", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_selection_excludes_items_inside_backoff_window() {
        let (queue, _dir) = open_queue().await;

        let item = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();
        queue
            .increment_attempts(item.id, AttemptFailure::http(503, "service unavailable"))
            .await
            .unwrap();

        // Default policy schedules the retry ~2s out.
        let batch = queue.retryable_batch(STORE_A, "pack", 10).await.unwrap();
        assert!(batch.is_empty());

        let found = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert!(found.is_pending());
        assert!(!found.is_retry_due(Utc::now()));
    }

    #[tokio::test]
    async fn test_selection_includes_items_with_elapsed_backoff() {
        let (queue, _dir) = open_queue_with_policy(zero_delay_policy()).await;

        let item = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();
        queue
            .increment_attempts(item.id, AttemptFailure::http(503, "service unavailable"))
            .await
            .unwrap();

        let batch = queue.retryable_batch(STORE_A, "pack", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].sync_attempts, 1);
        assert!(batch[0].is_retry_due(Utc::now()));
    }

    #[tokio::test]
    async fn test_selection_excludes_pull_items() {
        let (queue, _dir) = open_queue().await;

        queue.enqueue(pack_item(STORE_A, "push-1")).await.unwrap();
        queue
            .enqueue(pack_item(STORE_A, "pull-1").direction(SyncDirection::Pull))
            .await
            .unwrap();

        let batch = queue.retryable_batch(STORE_A, "pack", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].entity_id, "push-1");

        // The pull row still exists and counts as pending bookkeeping.
        assert_eq!(queue.pending_count(STORE_A).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_selection_excludes_terminal_items() {
        let (queue, _dir) = open_queue().await;

        let synced = queue.enqueue(pack_item(STORE_A, "synced")).await.unwrap();
        let dead = queue.enqueue(pack_item(STORE_A, "dead")).await.unwrap();
        queue.enqueue(pack_item(STORE_A, "live")).await.unwrap();

        queue.mark_synced(synced.id).await.unwrap();
        queue
            .dead_letter(DeadLetterRequest::new(dead.id, "operator reject"))
            .await
            .unwrap();

        let batch = queue.retryable_batch(STORE_A, "pack", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].entity_id, "live");
    }

    #[tokio::test]
    async fn test_selection_with_non_positive_limit_is_empty() {
        let (queue, _dir) = open_queue().await;
        queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();

        assert!(queue
            .retryable_batch(STORE_A, "pack", 0)
            .await
            .unwrap()
            .is_empty());
        assert!(queue
            .retryable_batch(STORE_A, "pack", -1)
            .await
            .unwrap()
            .is_empty());
    }
}

// =============================================================================
// Deferral semantics
// =============================================================================

mod deferral_tests {
    use super::*;

    #[tokio::test]
    async fn test_mark_and_restore_deferred_roundtrip() {
        let (queue, _dir) = open_queue().await;

        let item = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();
        assert!(queue.mark_deferred(item.id).await.unwrap());

        let deferred = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert!(deferred.deferred);
        assert_eq!(deferred.priority, DEFERRED_PRIORITY);
        assert_eq!(queue.deferred_count(STORE_A).await.unwrap(), 1);

        assert_eq!(queue.restore_deferred(STORE_A).await.unwrap(), 1);
        let restored = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert!(!restored.deferred);
        assert_eq!(restored.priority, 0);
        assert_eq!(queue.deferred_count(STORE_A).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_deferred_skips_terminal_items() {
        let (queue, _dir) = open_queue().await;

        let item = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();
        queue.mark_synced(item.id).await.unwrap();

        assert!(!queue.mark_deferred(item.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_deferred_items_sort_after_everything_else() {
        let (queue, _dir) = open_queue().await;

        let oldest = queue.enqueue(pack_item(STORE_A, "oldest")).await.unwrap();
        queue.enqueue(pack_item(STORE_A, "newer")).await.unwrap();
        queue.mark_deferred(oldest.id).await.unwrap();

        // Deferred items stay selectable but yield to every live item,
        // even ones enqueued after them.
        let batch = queue.retryable_batch(STORE_A, "pack", 10).await.unwrap();
        let order: Vec<&str> = batch.iter().map(|i| i.entity_id.as_str()).collect();
        assert_eq!(order, vec!["newer", "oldest"]);
    }
}

// =============================================================================
// Telemetry reads
// =============================================================================

mod telemetry_tests {
    use super::*;

    #[tokio::test]
    async fn test_partition_depths_are_exact_and_allowlisted() {
        let (queue, _dir) = open_queue().await;

        for n in 0..50 {
            queue
                .enqueue(item_of(STORE_A, EntityType::Pack, &format!("p-{n}")))
                .await
                .unwrap();
        }
        for n in 0..30 {
            queue
                .enqueue(item_of(STORE_A, EntityType::Shift, &format!("s-{n}")))
                .await
                .unwrap();
        }
        for n in 0..20 {
            queue
                .enqueue(item_of(STORE_A, EntityType::DayClose, &format!("d-{n}")))
                .await
                .unwrap();
        }

        let depths = queue.partition_depths(STORE_A).await.unwrap();
        assert_eq!(depths.len(), 3);
        assert_eq!(depths[&EntityType::Pack], 50);
        assert_eq!(depths[&EntityType::Shift], 30);
        assert_eq!(depths[&EntityType::DayClose], 20);

        // A store with no activity reads as empty, not as an error.
        assert!(queue.partition_depths(STORE_B).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_count_and_queue_size_bytes() {
        let (queue, _dir) = open_queue().await;

        let payloads = [
            json!({"pack_number": "pack-1"}),
            json!({"pack_number": "pack-2", "game_code": "G-200"}),
            json!({"pack_number": "pack-3", "tickets": [1, 2, 3, 4]}),
        ];
        let mut ids = Vec::new();
        let mut expected_bytes = 0i64;
        for (n, payload) in payloads.iter().enumerate() {
            let item = queue
                .enqueue(NewQueueItem::new(
                    STORE_A,
                    EntityType::Pack,
                    format!("pack-{n}"),
                    SyncOperation::Create,
                    payload.clone(),
                ))
                .await
                .unwrap();
            ids.push(item.id);
            expected_bytes += serde_json::to_string(payload).unwrap().len() as i64;
        }

        assert_eq!(queue.pending_count(STORE_A).await.unwrap(), 3);
        assert_eq!(queue.queue_size_bytes(STORE_A).await.unwrap(), expected_bytes);

        // Terminal items stop counting.
        let first_len = serde_json::to_string(&payloads[0]).unwrap().len() as i64;
        queue.mark_synced(ids[0]).await.unwrap();
        assert_eq!(queue.pending_count(STORE_A).await.unwrap(), 2);
        assert_eq!(
            queue.queue_size_bytes(STORE_A).await.unwrap(),
            expected_bytes - first_len
        );

        // An unknown store reads as zero.
        assert_eq!(queue.pending_count(STORE_B).await.unwrap(), 0);
        assert_eq!(queue.queue_size_bytes(STORE_B).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_oldest_pending_timestamp() {
        let (queue, _dir) = open_queue().await;

        assert!(queue
            .oldest_pending_timestamp(STORE_A)
            .await
            .unwrap()
            .is_none());

        let first = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();
        queue.enqueue(pack_item(STORE_A, "pack-2")).await.unwrap();

        let oldest = queue
            .oldest_pending_timestamp(STORE_A)
            .await
            .unwrap()
            .expect("oldest timestamp");
        assert!((oldest - first.created_at).num_milliseconds().abs() <= 1);
        assert!(oldest <= Utc::now());

        // Draining the queue empties the reading again.
        queue.mark_synced(first.id).await.unwrap();
        let batch = queue.retryable_batch(STORE_A, "pack", 10).await.unwrap();
        for item in batch {
            queue.mark_synced(item.id).await.unwrap();
        }
        assert!(queue
            .oldest_pending_timestamp(STORE_A)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_dead_letter_counts_and_listing() {
        let (queue, _dir) = open_queue().await;

        let first = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();
        let second = queue.enqueue(pack_item(STORE_A, "pack-2")).await.unwrap();
        queue.enqueue(pack_item(STORE_A, "pack-3")).await.unwrap();

        queue
            .dead_letter(DeadLetterRequest::new(first.id, "rejected upstream"))
            .await
            .unwrap();
        queue
            .dead_letter(DeadLetterRequest::new(second.id, "rejected upstream"))
            .await
            .unwrap();

        assert_eq!(queue.dead_lettered_count(STORE_A).await.unwrap(), 2);
        assert_eq!(queue.dead_lettered_count(STORE_B).await.unwrap(), 0);

        let items = queue.dead_lettered_items(STORE_A, 10).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.dead_lettered));
        // Most recently dead-lettered first.
        assert_eq!(items[0].id, second.id);
        assert_eq!(items[1].id, first.id);
    }

    #[tokio::test]
    async fn test_active_store_ids_lists_only_stores_with_pending_work() {
        let (queue, _dir) = open_queue().await;

        queue.enqueue(pack_item(STORE_B, "pack-1")).await.unwrap();
        let done = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();
        queue.mark_synced(done.id).await.unwrap();

        assert_eq!(queue.active_store_ids().await.unwrap(), vec![STORE_B]);
    }
}

// =============================================================================
// Outcome tracking
// =============================================================================

mod outcome_tests {
    use super::*;

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let (queue, _dir) = open_queue().await;
        let item = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();

        let before = Utc::now();
        let outcome = queue
            .increment_attempts(
                item.id,
                AttemptFailure::http(503, "service unavailable")
                    .endpoint("/api/v1/packs")
                    .response_body("backend busy"),
            )
            .await
            .unwrap();

        match outcome {
            AttemptOutcome::Retrying {
                attempts,
                retry_after,
            } => {
                assert_eq!(attempts, 1);
                // First retry lands one base delay (2s) out.
                assert!(retry_after > before + Duration::seconds(1));
                assert!(retry_after < before + Duration::seconds(4));
            }
            other => panic!("expected retry, got {other:?}"),
        }

        let found = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert!(found.is_pending());
        assert_eq!(found.sync_attempts, 1);
        assert_eq!(found.error_category, Some(ErrorCategory::Transient));
        assert_eq!(found.last_sync_error.as_deref(), Some("service unavailable"));
        assert!(found.last_attempt_at.is_some());
        assert_eq!(found.http_status, Some(503));
        assert_eq!(found.api_endpoint.as_deref(), Some("/api/v1/packs"));
        assert_eq!(found.response_body.as_deref(), Some("backend busy"));
        assert_eq!(found.attempts_remaining(), 4);
    }

    #[tokio::test]
    async fn test_backoff_window_doubles_on_second_failure() {
        let (queue, _dir) = open_queue().await;
        let item = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();

        queue
            .increment_attempts(item.id, AttemptFailure::http(500, "boom"))
            .await
            .unwrap();
        let before = Utc::now();
        let outcome = queue
            .increment_attempts(item.id, AttemptFailure::http(500, "boom again"))
            .await
            .unwrap();

        match outcome {
            AttemptOutcome::Retrying {
                attempts,
                retry_after,
            } => {
                assert_eq!(attempts, 2);
                // Second retry doubles to 4s.
                assert!(retry_after > before + Duration::seconds(3));
                assert!(retry_after < before + Duration::seconds(6));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_ceiling_dead_letters() {
        let (queue, _dir) = open_queue_with_policy(zero_delay_policy()).await;
        let item = queue
            .enqueue(pack_item(STORE_A, "pack-1").max_attempts(2))
            .await
            .unwrap();

        let first = queue
            .increment_attempts(item.id, AttemptFailure::http(500, "boom"))
            .await
            .unwrap();
        assert!(matches!(first, AttemptOutcome::Retrying { attempts: 1, .. }));

        let second = queue
            .increment_attempts(item.id, AttemptFailure::http(500, "boom"))
            .await
            .unwrap();
        match second {
            AttemptOutcome::DeadLettered { attempts, reason } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("retry ceiling reached (2/2)"), "{reason}");
            }
            other => panic!("expected dead letter, got {other:?}"),
        }

        let found = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert!(found.dead_lettered);
        assert!(found.dead_lettered_at.is_some());
        assert!(found.retry_after.is_none());
        assert_eq!(found.sync_attempts, 2);

        // Dead-lettered items never come back, even with elapsed backoff.
        let batch = queue.retryable_batch(STORE_A, "pack", 10).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_immediately() {
        let (queue, _dir) = open_queue().await;
        let item = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();

        let outcome = queue
            .increment_attempts(item.id, AttemptFailure::http(422, "unknown game code"))
            .await
            .unwrap();

        match outcome {
            AttemptOutcome::DeadLettered { attempts, reason } => {
                assert_eq!(attempts, 1);
                assert!(reason.starts_with("permanent failure:"), "{reason}");
            }
            other => panic!("expected dead letter, got {other:?}"),
        }

        let found = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert!(found.dead_lettered);
        assert_eq!(found.error_category, Some(ErrorCategory::Permanent));
        assert_eq!(found.http_status, Some(422));
    }

    #[tokio::test]
    async fn test_structural_failure_dead_letters_immediately() {
        let (queue, _dir) = open_queue().await;
        let item = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();

        let outcome = queue
            .increment_attempts(
                item.id,
                AttemptFailure::new("failed to serialize payload: missing field `ticket_count`"),
            )
            .await
            .unwrap();

        match outcome {
            AttemptOutcome::DeadLettered { reason, .. } => {
                assert!(reason.starts_with("structural failure:"), "{reason}");
            }
            other => panic!("expected dead letter, got {other:?}"),
        }

        let found = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(found.error_category, Some(ErrorCategory::Structural));
    }

    #[tokio::test]
    async fn test_unclassifiable_failure_still_retries() {
        let (queue, _dir) = open_queue().await;
        let item = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();

        let outcome = queue
            .increment_attempts(item.id, AttemptFailure::new("weird upstream response"))
            .await
            .unwrap();

        assert!(matches!(outcome, AttemptOutcome::Retrying { attempts: 1, .. }));
        let found = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(found.error_category, Some(ErrorCategory::Unknown));
        assert!(found.is_pending());
    }

    #[tokio::test]
    async fn test_terminal_states_absorb_late_outcomes() {
        let (queue, _dir) = open_queue().await;

        let synced = queue.enqueue(pack_item(STORE_A, "synced")).await.unwrap();
        assert!(queue.mark_synced(synced.id).await.unwrap());

        // A late failure report against a synced item changes nothing.
        let outcome = queue
            .increment_attempts(synced.id, AttemptFailure::http(500, "late report"))
            .await
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::AlreadyTerminal);
        let found = queue.find_by_id(synced.id).await.unwrap().unwrap();
        assert!(found.synced);
        assert_eq!(found.sync_attempts, 0);

        // mark_synced is idempotent; dead_letter cannot flip a synced item.
        assert!(!queue.mark_synced(synced.id).await.unwrap());
        assert!(!queue
            .dead_letter(DeadLetterRequest::new(synced.id, "too late"))
            .await
            .unwrap());

        // Same the other way around.
        let dead = queue.enqueue(pack_item(STORE_A, "dead")).await.unwrap();
        queue
            .dead_letter(DeadLetterRequest::new(dead.id, "operator reject"))
            .await
            .unwrap();
        assert!(!queue.mark_synced(dead.id).await.unwrap());
        let outcome = queue
            .increment_attempts(dead.id, AttemptFailure::http(500, "late report"))
            .await
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::AlreadyTerminal);
    }

    #[tokio::test]
    async fn test_increment_attempts_on_unknown_id_is_not_found() {
        let (queue, _dir) = open_queue().await;

        let err = queue
            .increment_attempts(Uuid::new_v4(), AttemptFailure::new("boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncQueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_manual_dead_letter_records_diagnostics() {
        let (queue, _dir) = open_queue().await;
        let item = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();

        let marked = queue
            .dead_letter(
                DeadLetterRequest::new(item.id, "payload no longer deserializes")
                    .category(ErrorCategory::Structural)
                    .error("invalid payload: truncated"),
            )
            .await
            .unwrap();
        assert!(marked);

        let found = queue.find_by_id(item.id).await.unwrap().unwrap();
        assert!(found.dead_lettered);
        assert_eq!(
            found.dead_letter_reason.as_deref(),
            Some("payload no longer deserializes")
        );
        assert_eq!(found.error_category, Some(ErrorCategory::Structural));
        assert_eq!(
            found.last_sync_error.as_deref(),
            Some("invalid payload: truncated")
        );
    }
}

// =============================================================================
// Housekeeping
// =============================================================================

mod housekeeping_tests {
    use super::*;

    #[tokio::test]
    async fn test_purge_terminal_removes_only_old_terminal_rows() {
        let (queue, _dir) = open_queue().await;

        let synced = queue.enqueue(pack_item(STORE_A, "synced")).await.unwrap();
        let dead = queue.enqueue(pack_item(STORE_A, "dead")).await.unwrap();
        let live = queue.enqueue(pack_item(STORE_A, "live")).await.unwrap();
        let other = queue.enqueue(pack_item(STORE_B, "other")).await.unwrap();

        queue.mark_synced(synced.id).await.unwrap();
        queue.mark_synced(other.id).await.unwrap();
        queue
            .dead_letter(DeadLetterRequest::new(dead.id, "operator reject"))
            .await
            .unwrap();

        let purged = queue
            .purge_terminal(STORE_A, Utc::now() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(purged, 2);

        // Pending rows and other stores are untouched.
        assert!(queue.find_by_id(synced.id).await.unwrap().is_none());
        assert!(queue.find_by_id(dead.id).await.unwrap().is_none());
        assert!(queue.find_by_id(live.id).await.unwrap().is_some());
        assert!(queue.find_by_id(other.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_terminal_respects_cutoff() {
        let (queue, _dir) = open_queue().await;

        let item = queue.enqueue(pack_item(STORE_A, "pack-1")).await.unwrap();
        queue.mark_synced(item.id).await.unwrap();

        // A cutoff in the past keeps the freshly-synced row.
        let purged = queue
            .purge_terminal(STORE_A, Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);
        assert!(queue.find_by_id(item.id).await.unwrap().is_some());
    }
}
