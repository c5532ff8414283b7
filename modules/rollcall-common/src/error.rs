use thiserror::Error;

pub type Result<T> = std::result::Result<T, RollcallError>;

#[derive(Error, Debug)]
pub enum RollcallError {
    #[error("Rate limited: retries exhausted (last wait {wait_seconds}s)")]
    RateLimited { wait_seconds: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Session invalid, re-authentication required: {0}")]
    SessionInvalid(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Storage write failed: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl RollcallError {
    /// Errors that end the whole run rather than a single operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RollcallError::SessionInvalid(_) | RollcallError::Storage(_)
        )
    }
}
