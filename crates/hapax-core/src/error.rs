use thiserror::Error;

/// Unified error type for the Hapax gateway, one variant per §7 taxonomy entry.
#[derive(Error, Debug)]
pub enum HapaxError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limit exceeded")]
    RateLimit { limit: u32, window: String },

    #[error("upstream provider error: {0}")]
    Provider(String),

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("admission queue is full")]
    QueueFull,

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("replay detected")]
    Replay,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl HapaxError {
    /// The §7 taxonomy kind string carried in the error response body.
    pub fn kind(&self) -> &'static str {
        match self {
            HapaxError::Validation(_) => "validation",
            HapaxError::Authentication(_) => "authentication",
            HapaxError::RateLimit { .. } => "rate_limit",
            HapaxError::Provider(_) => "provider",
            HapaxError::CircuitOpen => "circuit_open",
            HapaxError::QueueFull => "queue_full",
            HapaxError::Timeout => "timeout",
            HapaxError::Cancelled => "internal",
            HapaxError::Replay => "replay",
            HapaxError::Internal(_) => "internal",
            HapaxError::Config(_) => "internal",
            HapaxError::Io(_) => "internal",
            HapaxError::Serialization(_) => "internal",
            HapaxError::Other(_) => "internal",
        }
    }

    /// Whether this error represents the caller's own cancellation, as opposed
    /// to an upstream failure. Breaker accounting must not count these as
    /// provider failures (§5 Cancellation, §9 Open Question 1).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, HapaxError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, HapaxError>;
