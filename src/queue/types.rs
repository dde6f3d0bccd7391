//! Queue item model and the entity-type allowlist.
//!
//! Every offline mutation the station produces becomes a [`QueueItem`] row.
//! Entity types are a closed enum rather than free-form strings so that a
//! bad caller cannot create a partition the dispatcher will never drain.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ceiling on sync attempts unless the producer or retry policy overrides it.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Priority written to deferred items so legacy readers that only know the
/// sentinel keep ordering them last.
pub const DEFERRED_PRIORITY: i32 = -1;

/// Entity types eligible for queueing.
///
/// The wire names (snake_case) are a compatibility contract with the sync
/// API and the station UI; changing them breaks replay of persisted rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Pack,
    Shift,
    DayOpen,
    DayClose,
    Return,
    VarianceApproval,
}

impl EntityType {
    /// All allowlisted entity types, in dispatch order.
    pub const ALL: [EntityType; 6] = [
        EntityType::Pack,
        EntityType::Shift,
        EntityType::DayOpen,
        EntityType::DayClose,
        EntityType::Return,
        EntityType::VarianceApproval,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            EntityType::Pack => "pack",
            EntityType::Shift => "shift",
            EntityType::DayOpen => "day_open",
            EntityType::DayClose => "day_close",
            EntityType::Return => "return",
            EntityType::VarianceApproval => "variance_approval",
        }
    }

    /// Parse a wire name. Anything off the allowlist yields `None`; callers
    /// that read from the queue treat that as an empty partition rather
    /// than an error.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pack" => Some(EntityType::Pack),
            "shift" => Some(EntityType::Shift),
            "day_open" => Some(EntityType::DayOpen),
            "day_close" => Some(EntityType::DayClose),
            "return" => Some(EntityType::Return),
            "variance_approval" => Some(EntityType::VarianceApproval),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation kind carried by a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
    /// Pack activation at the register; modeled separately from `Update`
    /// because the remote exposes it as its own endpoint.
    Activate,
}

impl SyncOperation {
    pub const fn as_str(self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
            SyncOperation::Activate => "activate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(SyncOperation::Create),
            "update" => Some(SyncOperation::Update),
            "delete" => Some(SyncOperation::Delete),
            "activate" => Some(SyncOperation::Activate),
            _ => None,
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a queue item relative to the remote backend.
///
/// Only `Push` items are ever handed to the dispatcher; `Pull` items are
/// bookkeeping for inbound refreshes and stay invisible to retry selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Push,
    Pull,
}

impl SyncDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            SyncDirection::Push => "push",
            SyncDirection::Pull => "pull",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "push" => Some(SyncDirection::Push),
            "pull" => Some(SyncDirection::Pull),
            _ => None,
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network trouble or a 5xx from the remote; worth retrying.
    Transient,
    /// The remote rejected the request outright (4xx); resending the same
    /// payload cannot succeed.
    Permanent,
    /// The payload or local schema is broken; detected before or during
    /// serialization, never worth a network attempt.
    Structural,
    /// Could not be classified; treated like `Transient`.
    Unknown,
}

impl ErrorCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Structural => "structural",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(ErrorCategory::Transient),
            "permanent" => Some(ErrorCategory::Permanent),
            "structural" => Some(ErrorCategory::Structural),
            "unknown" => Some(ErrorCategory::Unknown),
            _ => None,
        }
    }

    /// Whether another delivery attempt may succeed.
    pub const fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::Unknown)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted sync queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique item ID
    pub id: Uuid,

    /// Owning store (tenant); never empty
    pub store_id: String,

    /// Partition within the store
    pub entity_type: EntityType,

    /// Domain identifier of the entity the mutation applies to
    pub entity_id: String,

    /// Mutation kind
    pub operation: SyncOperation,

    /// Opaque JSON payload captured at enqueue time
    pub payload: serde_json::Value,

    /// Selection priority; higher drains first, `-1` marks a deferred item
    pub priority: i32,

    /// Set by the backpressure controller; deferred items sort last
    pub deferred: bool,

    /// Terminal success flag
    pub synced: bool,

    /// Completed delivery attempts so far
    pub sync_attempts: i32,

    /// Attempt ceiling for this item
    pub max_attempts: i32,

    /// Message of the most recent failure
    pub last_sync_error: Option<String>,

    /// When the most recent attempt finished
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Classification of the most recent failure
    pub error_category: Option<ErrorCategory>,

    /// Earliest instant the item becomes selectable again
    pub retry_after: Option<DateTime<Utc>>,

    /// Terminal failure flag; absorbing, never cleared automatically
    pub dead_lettered: bool,

    /// Why the item was dead-lettered
    pub dead_letter_reason: Option<String>,

    /// When the item was dead-lettered
    pub dead_lettered_at: Option<DateTime<Utc>>,

    /// Push (station to backend) or pull bookkeeping
    pub sync_direction: SyncDirection,

    /// Client-generated key the remote uses to de-duplicate deliveries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Remote endpoint recorded from the last attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,

    /// HTTP status recorded from the last attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<i32>,

    /// Response body recorded from the last attempt, for diagnostics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,

    /// When the item was enqueued; FIFO tie-breaker within a priority
    pub created_at: DateTime<Utc>,

    /// When the item was marked synced
    pub synced_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Neither synced nor dead-lettered.
    pub fn is_pending(&self) -> bool {
        !self.synced && !self.dead_lettered
    }

    /// Whether the backoff window has elapsed at `now`.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.map_or(true, |after| after <= now)
    }

    /// Attempts remaining before forced dead-lettering.
    pub fn attempts_remaining(&self) -> i32 {
        (self.max_attempts - self.sync_attempts).max(0)
    }
}

/// Input for [`SyncQueue::enqueue`](crate::queue::SyncQueue::enqueue).
///
/// Producers build one per local mutation; everything not set here is
/// lifecycle state owned by the queue itself.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub store_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub sync_direction: SyncDirection,
    pub idempotency_key: Option<String>,
    /// Per-item attempt ceiling; `None` takes the retry policy default.
    pub max_attempts: Option<i32>,
}

impl NewQueueItem {
    /// Create an item with default priority (0), push direction, and the
    /// policy-level attempt ceiling.
    pub fn new(
        store_id: impl Into<String>,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: SyncOperation,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            entity_type,
            entity_id: entity_id.into(),
            operation,
            payload,
            priority: 0,
            sync_direction: SyncDirection::Push,
            idempotency_key: None,
            max_attempts: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn direction(mut self, direction: SyncDirection) -> Self {
        self.sync_direction = direction;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}
