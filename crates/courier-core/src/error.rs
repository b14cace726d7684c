use thiserror::Error;

/// Top-level error type for Courier.
#[derive(Debug, Error)]
pub enum CourierError {
    /// Error from the agent runner.
    #[error("agent error: {0}")]
    Agent(String),

    /// Error from an outbound delivery adapter.
    #[error("channel error: {0}")]
    Channel(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Session store error.
    #[error("store error: {0}")]
    Store(String),

    /// Request/params validation error.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failure (bad token, locked out, origin denied).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Referenced session, run, or label does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// More than one session matched a label that should be unique.
    #[error("multiple sessions found for label '{0}'")]
    AmbiguousLabel(String),

    /// State conflict (duplicate label, immutable session id, ...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A bounded wait elapsed before the downstream settled.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The run was cancelled before completion.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
