use thiserror::Error;

pub type TcmsgResult<T> = Result<T, TcmsgError>;

#[derive(Debug, Error)]
pub enum TcmsgError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by a conversation store backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation '{op}' timed out after {timeout_ms} ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("'{acting}' may not update message {message_id}: only its recipient can")]
    Forbidden { message_id: String, acting: String },

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("invalid message record: {0}")]
    InvalidRecord(String),
}
