use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdmitError {
    #[error("Storage unavailable: primary: {primary}; fallback: {fallback}")]
    StorageUnavailable { primary: String, fallback: String },

    #[error("Storage write failed on {store}: {reason}")]
    StorageWriteFailed { store: String, reason: String },

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    RedisPool(String),

    #[error("Redis call timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AdmitError {
    /// True for errors raised by a storage backend (as opposed to configuration
    /// or file loading). Callers use this to pick a fail-open or fail-closed posture.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            AdmitError::StorageUnavailable { .. }
                | AdmitError::StorageWriteFailed { .. }
                | AdmitError::Redis(_)
                | AdmitError::RedisPool(_)
                | AdmitError::Timeout(_)
                | AdmitError::Serialization(_)
        )
    }
}

/// Result type alias for admission control operations
pub type Result<T> = std::result::Result<T, AdmitError>;
