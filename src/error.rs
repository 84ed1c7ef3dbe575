use thiserror::Error;

/// Errors surfaced by the pool, the rotation records and the manager façade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RotationError {
    /// A rebuild was attempted and still could not house every holder.
    #[error("identity pool exhausted: {requested} identities needed, {capacity} available after rebuild")]
    PoolExhausted { requested: usize, capacity: usize },

    #[error("agent `{0}` is already registered")]
    DuplicateAgent(String),

    #[error("agent `{0}` not found")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown configuration field `{0}`")]
    UnknownField(String),
}

impl RotationError {
    /// Exhaustion clears up once identities are released or the pool is rebuilt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RotationError::PoolExhausted { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid subnet `{0}`")]
    InvalidSubnet(String),
}

/// Failure of a single endpoint source during a catalog refresh.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("{0}")]
    Other(String),
}
