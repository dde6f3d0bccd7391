use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncQueueError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt queue row: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, SyncQueueError>;
