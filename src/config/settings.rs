use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::backpressure::BackpressureSettings;
use crate::dispatcher::DispatchSettings;
use crate::queue::RetryPolicy;
use crate::store::StoreConfig;

/// Top-level engine configuration.
///
/// Every section is optional; absent sections fall back to their
/// defaults, so an empty config file (or none at all) yields a working
/// engine writing to `sync_queue.db` in the working directory.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: StoreConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub backpressure: BackpressureSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: StoreConfig::default(),
            retry: RetryPolicy::default(),
            backpressure: BackpressureSettings::default(),
            dispatch: DispatchSettings::default(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("database.database_path", "sync_queue.db")?
            .set_default("retry.max_attempts", 5)?
            .set_default("retry.base_delay_secs", 2)?
            .set_default("retry.max_delay_secs", 300)?
            .set_default("dispatch.batch_size", 25)?
            .set_default("dispatch.poll_interval_ms", 2_000)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SYNCQ_DATABASE__DATABASE_PATH, SYNCQ_RETRY__MAX_ATTEMPTS, etc.
            // Double underscore separates sections so field names can keep
            // their own underscores.
            .add_source(
                Environment::with_prefix("SYNCQ")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }
}
