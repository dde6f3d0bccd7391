//! SQLite record store for the sync queue.
//!
//! The queue table lives in the station's local database. WAL mode keeps
//! readers (telemetry, the UI) from blocking the enqueue path, and NORMAL
//! synchronous is durable enough under WAL for point-of-sale crash
//! recovery.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::Result;

/// Connection settings for the local queue database.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Database file path
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Maximum number of pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// How long a writer waits on a locked database before failing
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_database_path() -> String {
    "sync_queue.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_busy_timeout_secs() -> u64 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

impl StoreConfig {
    /// Default configuration against a specific database file.
    pub fn with_database_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            database_path: path.as_ref().to_string_lossy().to_string(),
            ..Self::default()
        }
    }

    fn build_connect_options(&self) -> Result<SqliteConnectOptions> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", self.database_path))?
            .journal_mode(SqliteJournalMode::Wal)
            // NORMAL is safe with WAL and much cheaper than FULL
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(self.busy_timeout_secs))
            .pragma("temp_store", "memory")
            .optimize_on_close(true, None);
        Ok(options)
    }

    /// Create the connection pool and verify WAL took effect.
    pub async fn create_pool(&self) -> Result<SqlitePool> {
        info!(path = %self.database_path, "opening sync queue database");

        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs))
            .test_before_acquire(true)
            .connect_with(self.build_connect_options()?)
            .await?;

        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(&pool).await?;
        if mode.0.to_uppercase() != "WAL" {
            tracing::warn!(mode = %mode.0, "expected WAL journal mode");
        }

        Ok(pool)
    }
}

/// Open the database and make sure the queue schema exists.
pub async fn open(config: &StoreConfig) -> Result<SqlitePool> {
    let pool = config.create_pool().await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Create the `sync_queue` table and its indexes. Idempotent; runs at
/// every startup before the first enqueue.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_queue (
            id TEXT PRIMARY KEY,
            store_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            deferred INTEGER NOT NULL DEFAULT 0,
            synced INTEGER NOT NULL DEFAULT 0,
            sync_attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 5,
            last_sync_error TEXT,
            last_attempt_at TEXT,
            error_category TEXT,
            retry_after TEXT,
            dead_lettered INTEGER NOT NULL DEFAULT 0,
            dead_letter_reason TEXT,
            dead_lettered_at TEXT,
            sync_direction TEXT NOT NULL DEFAULT 'push',
            idempotency_key TEXT,
            api_endpoint TEXT,
            http_status INTEGER,
            response_body TEXT,
            created_at TEXT NOT NULL,
            synced_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Hot paths: tenant scans, pending-state filters, partition selection,
    // and the oldest-pending probe.
    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_store ON sync_queue (store_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_store_state \
         ON sync_queue (store_id, synced, dead_lettered)",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_store_entity \
         ON sync_queue (store_id, entity_type)",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_store_created \
         ON sync_queue (store_id, synced, created_at)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    debug!("sync queue schema ready");
    Ok(())
}
