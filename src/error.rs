//! Error types for the dispatcher

use thiserror::Error;

/// Main error type for job dispatch
///
/// The variant is the error *kind*; the orchestrator decides between retrying and
/// failing a job from the kind alone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid nonce, job reset for recovery: {0}")]
    InvalidNonceWarning(String),

    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("known transaction: {0}")]
    KnownTransaction(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("node rejected request: {0}")]
    NodeRejected(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Connection(_) | DispatchError::InvalidNonceWarning(_)
        )
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, DispatchError::Connection(_))
    }

    /// Prefix the message with the component that surfaced the error.
    /// The kind is left untouched.
    pub fn in_component(self, component: &str) -> Self {
        let tag = |msg: String| format!("{component}: {msg}");
        match self {
            DispatchError::InvalidParameter(m) => DispatchError::InvalidParameter(tag(m)),
            DispatchError::InvalidFormat(m) => DispatchError::InvalidFormat(tag(m)),
            DispatchError::AlreadyExists(m) => DispatchError::AlreadyExists(tag(m)),
            DispatchError::NotFound(m) => DispatchError::NotFound(tag(m)),
            DispatchError::InvalidState(m) => DispatchError::InvalidState(tag(m)),
            DispatchError::Connection(m) => DispatchError::Connection(tag(m)),
            DispatchError::InvalidNonceWarning(m) => DispatchError::InvalidNonceWarning(tag(m)),
            DispatchError::InvalidNonce(m) => DispatchError::InvalidNonce(tag(m)),
            DispatchError::KnownTransaction(m) => DispatchError::KnownTransaction(tag(m)),
            DispatchError::Encoding(m) => DispatchError::Encoding(tag(m)),
            DispatchError::NodeRejected(m) => DispatchError::NodeRejected(tag(m)),
            DispatchError::Storage(m) => DispatchError::Storage(tag(m)),
            DispatchError::Config(m) => DispatchError::Config(tag(m)),
            DispatchError::Internal(m) => DispatchError::Internal(tag(m)),
            DispatchError::Cancelled => DispatchError::Cancelled,
        }
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InvalidParameter(_) => "invalid_parameter",
            DispatchError::InvalidFormat(_) => "invalid_format",
            DispatchError::AlreadyExists(_) => "already_exists",
            DispatchError::NotFound(_) => "not_found",
            DispatchError::InvalidState(_) => "invalid_state",
            DispatchError::Connection(_) => "connection",
            DispatchError::InvalidNonceWarning(_) => "invalid_nonce_warning",
            DispatchError::InvalidNonce(_) => "invalid_nonce",
            DispatchError::KnownTransaction(_) => "known_transaction",
            DispatchError::Encoding(_) => "encoding",
            DispatchError::NodeRejected(_) => "node_rejected",
            DispatchError::Storage(_) => "storage",
            DispatchError::Config(_) => "config",
            DispatchError::Cancelled => "cancelled",
            DispatchError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for DispatchError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DispatchError::NotFound(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DispatchError::Connection(err.to_string()),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                DispatchError::AlreadyExists(db.message().to_string())
            }
            other => DispatchError::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Encoding(err.to_string())
    }
}

/// Result type for dispatcher operations
pub type DispatchResult<T> = Result<T, DispatchError>;
