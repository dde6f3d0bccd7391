//! Attempt and outcome tracking for queue items.
//!
//! Every dispatch attempt ends here: success marks the item synced,
//! failure records diagnostics and either schedules a retry behind a
//! backoff window or parks the item in the dead-letter state. Both
//! terminal states are absorbing.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use sqlx::Row;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::types::{ErrorCategory, DEFAULT_MAX_ATTEMPTS};
use super::SyncQueue;
use crate::error::{Result, SyncQueueError};
use crate::metrics::{
    SYNC_ATTEMPT_FAILURES_TOTAL, SYNC_DEAD_LETTERED_TOTAL, SYNC_SYNCED_TOTAL,
};

/// Retry behavior shared by every item that does not override it.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Attempt ceiling applied when the producer does not set one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Delay before the first retry; doubles on each further failure
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Upper bound on the doubled delay
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> i32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_secs() -> u64 {
    2
}

fn default_max_delay_secs() -> u64 {
    300
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Diagnostics from one failed delivery attempt.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    /// Failure message, used for classification when no status is present
    pub error: String,
    /// Remote endpoint the attempt targeted
    pub api_endpoint: Option<String>,
    /// HTTP status, when the remote answered at all
    pub http_status: Option<u16>,
    /// Response body, truncated by the transport if oversized
    pub response_body: Option<String>,
}

impl AttemptFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            api_endpoint: None,
            http_status: None,
            response_body: None,
        }
    }

    /// Failure carrying an HTTP status from the remote.
    pub fn http(status: u16, error: impl Into<String>) -> Self {
        Self {
            http_status: Some(status),
            ..Self::new(error)
        }
    }

    /// Failure for a delivery that exceeded its time budget.
    pub fn timeout(after_ms: u64) -> Self {
        Self::new(format!("delivery timed out after {after_ms}ms"))
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.api_endpoint = Some(endpoint.into());
        self
    }

    pub fn response_body(mut self, body: impl Into<String>) -> Self {
        self.response_body = Some(body.into());
        self
    }
}

/// What [`SyncQueue::increment_attempts`] did with the failure.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Failure recorded; the item stays pending behind its backoff window.
    Retrying {
        attempts: i32,
        retry_after: DateTime<Utc>,
    },
    /// Failure recorded and the item was parked in the dead-letter state.
    DeadLettered { attempts: i32, reason: String },
    /// The item was already synced or dead-lettered; nothing changed.
    AlreadyTerminal,
}

/// Caller-initiated dead-letter, for failures detected outside a normal
/// dispatch attempt (e.g. a payload that no longer deserializes).
#[derive(Debug, Clone)]
pub struct DeadLetterRequest {
    pub id: Uuid,
    pub reason: String,
    pub category: Option<ErrorCategory>,
    pub error: Option<String>,
}

impl DeadLetterRequest {
    pub fn new(id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
            category: None,
            error: None,
        }
    }

    pub fn category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Classify a failed attempt.
///
/// An HTTP status from the remote wins over message sniffing: 5xx plus the
/// retry-worthy 408/429 are transient, every other 4xx is a permanent
/// rejection. Without a status, the message decides.
pub fn classify_failure(failure: &AttemptFailure) -> ErrorCategory {
    if let Some(status) = failure.http_status {
        return match status {
            408 | 429 => ErrorCategory::Transient,
            400..=499 => ErrorCategory::Permanent,
            500..=599 => ErrorCategory::Transient,
            _ => classify_message(&failure.error),
        };
    }
    classify_message(&failure.error)
}

fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();

    if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("network")
        || lower.contains("unreachable")
        || lower.contains("dns")
        || lower.contains("offline")
    {
        return ErrorCategory::Transient;
    }

    if lower.contains("serialize")
        || lower.contains("deserialize")
        || lower.contains("schema")
        || lower.contains("invalid payload")
        || lower.contains("malformed")
        || lower.contains("missing field")
    {
        return ErrorCategory::Structural;
    }

    ErrorCategory::Unknown
}

/// Backoff delay for the given completed attempt count.
///
/// Pure and deterministic: attempt 1 waits the base delay, each further
/// attempt doubles it up to the policy cap. Callers persist `now + delay`
/// as the item's `retry_after`, so the schedule survives restarts.
pub fn compute_backoff(attempt: i32, policy: &RetryPolicy) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
    let delay_secs = policy
        .base_delay_secs
        .saturating_mul(1u64 << exponent)
        .min(policy.max_delay_secs);
    Duration::seconds(delay_secs as i64)
}

impl SyncQueue {
    /// Record a failed attempt, atomically deciding between retry and
    /// dead-letter.
    ///
    /// The read of the current attempt count and the state write happen in
    /// one transaction, so two racing outcome reports cannot both schedule
    /// a retry past the ceiling. Non-retryable failures (permanent,
    /// structural) dead-letter on the spot regardless of remaining
    /// attempts.
    #[instrument(skip(self, failure), fields(item_id = %id))]
    pub async fn increment_attempts(
        &self,
        id: Uuid,
        failure: AttemptFailure,
    ) -> Result<AttemptOutcome> {
        let now = Utc::now();
        let category = classify_failure(&failure);
        let status = failure.http_status.map(i32::from);

        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            "SELECT sync_attempts, max_attempts, synced, dead_lettered \
             FROM sync_queue WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(SyncQueueError::NotFound(format!("queue item {id}")));
        };

        let synced: bool = row.try_get("synced")?;
        let dead_lettered: bool = row.try_get("dead_lettered")?;
        if synced || dead_lettered {
            // Terminal states are absorbing; a late outcome report is dropped.
            tx.commit().await?;
            debug!(category = %category, "outcome for terminal item ignored");
            return Ok(AttemptOutcome::AlreadyTerminal);
        }

        let prior_attempts: i32 = row.try_get("sync_attempts")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let attempts = prior_attempts + 1;

        let outcome = if !category.is_retryable() || attempts >= max_attempts {
            let reason = if !category.is_retryable() {
                format!("{category} failure: {}", failure.error)
            } else {
                format!(
                    "retry ceiling reached ({attempts}/{max_attempts}): {}",
                    failure.error
                )
            };

            sqlx::query(
                "UPDATE sync_queue SET \
                   sync_attempts = ?2, last_sync_error = ?3, last_attempt_at = ?4, \
                   error_category = ?5, api_endpoint = COALESCE(?6, api_endpoint), \
                   http_status = ?7, response_body = ?8, retry_after = NULL, \
                   dead_lettered = 1, dead_letter_reason = ?9, dead_lettered_at = ?4 \
                 WHERE id = ?1",
            )
            .bind(id.to_string())
            .bind(attempts)
            .bind(&failure.error)
            .bind(now)
            .bind(category.as_str())
            .bind(&failure.api_endpoint)
            .bind(status)
            .bind(&failure.response_body)
            .bind(&reason)
            .execute(&mut *tx)
            .await?;

            warn!(attempts, category = %category, reason = %reason, "item dead-lettered");
            SYNC_DEAD_LETTERED_TOTAL
                .with_label_values(&[category.as_str()])
                .inc();

            AttemptOutcome::DeadLettered { attempts, reason }
        } else {
            let retry_after = now + compute_backoff(attempts, self.retry_policy());

            sqlx::query(
                "UPDATE sync_queue SET \
                   sync_attempts = ?2, last_sync_error = ?3, last_attempt_at = ?4, \
                   error_category = ?5, api_endpoint = COALESCE(?6, api_endpoint), \
                   http_status = ?7, response_body = ?8, retry_after = ?9 \
                 WHERE id = ?1",
            )
            .bind(id.to_string())
            .bind(attempts)
            .bind(&failure.error)
            .bind(now)
            .bind(category.as_str())
            .bind(&failure.api_endpoint)
            .bind(status)
            .bind(&failure.response_body)
            .bind(retry_after)
            .execute(&mut *tx)
            .await?;

            debug!(
                attempts,
                max_attempts,
                category = %category,
                retry_after = %retry_after,
                "attempt recorded; retry scheduled"
            );

            AttemptOutcome::Retrying {
                attempts,
                retry_after,
            }
        };

        tx.commit().await?;
        SYNC_ATTEMPT_FAILURES_TOTAL
            .with_label_values(&[category.as_str()])
            .inc();
        Ok(outcome)
    }

    /// Mark an item synced. Idempotent: returns `false` without touching
    /// anything when the item is missing or already terminal, so replayed
    /// delivery confirmations are harmless.
    pub async fn mark_synced(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sync_queue SET synced = 1, synced_at = ?2, retry_after = NULL \
             WHERE id = ?1 AND synced = 0 AND dead_lettered = 0",
        )
        .bind(id.to_string())
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        let marked = result.rows_affected() > 0;
        if marked {
            SYNC_SYNCED_TOTAL.inc();
            debug!(item_id = %id, "item synced");
        } else {
            debug!(item_id = %id, "mark_synced on missing or terminal item; no-op");
        }
        Ok(marked)
    }

    /// Dead-letter an item outside the normal attempt path. Returns `false`
    /// when the item is missing or already terminal.
    #[instrument(skip(self, request), fields(item_id = %request.id))]
    pub async fn dead_letter(&self, request: DeadLetterRequest) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sync_queue SET \
               dead_lettered = 1, dead_letter_reason = ?2, dead_lettered_at = ?3, \
               error_category = COALESCE(?4, error_category), \
               last_sync_error = COALESCE(?5, last_sync_error), retry_after = NULL \
             WHERE id = ?1 AND synced = 0 AND dead_lettered = 0",
        )
        .bind(request.id.to_string())
        .bind(&request.reason)
        .bind(Utc::now())
        .bind(request.category.map(|c| c.as_str()))
        .bind(&request.error)
        .execute(self.pool())
        .await?;

        let marked = result.rows_affected() > 0;
        if marked {
            let category = request.category.unwrap_or(ErrorCategory::Unknown);
            warn!(reason = %request.reason, category = %category, "item dead-lettered by caller");
            SYNC_DEAD_LETTERED_TOTAL
                .with_label_values(&[category.as_str()])
                .inc();
        }
        Ok(marked)
    }
}
