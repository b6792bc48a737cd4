use thiserror::Error;

/// Coarse classification used by the RPC layer to decide how much detail a
/// client is shown and whether an operation is safe to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Auth,
    Network,
    BadInput,
    Io,
    Corruption,
    LockTimeout,
    Cancelled,
    Internal,
}

#[derive(Error, Debug)]
pub enum CidxError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("embedding API authentication failed")]
    Auth,

    #[error("network error: {0}")]
    Network(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt on-disk structure: {0}")]
    Corruption(String),

    #[error("lock acquisition timed out after {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type CidxResult<T> = Result<T, CidxError>;

impl CidxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CidxError::Config(_) => ErrorKind::Config,
            CidxError::Auth => ErrorKind::Auth,
            CidxError::Network(_) => ErrorKind::Network,
            CidxError::BadInput(_) => ErrorKind::BadInput,
            CidxError::Io(_) => ErrorKind::Io,
            CidxError::Serde(_) => ErrorKind::BadInput,
            CidxError::Corruption(_) => ErrorKind::Corruption,
            CidxError::LockTimeout(_) => ErrorKind::LockTimeout,
            CidxError::Cancelled => ErrorKind::Cancelled,
            CidxError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Short, actionable, user-visible message. Never includes internal
    /// identifiers (paths under the data dir, raw stack traces).
    pub fn user_message(&self) -> String {
        match self {
            CidxError::Config(msg) => format!("configuration error: {msg}"),
            CidxError::Auth => "embedding API rejected the configured credentials".to_string(),
            CidxError::Network(_) => "embedding API is unreachable; retried and gave up".to_string(),
            CidxError::BadInput(msg) => msg.clone(),
            CidxError::Io(_) => "a file-system operation failed".to_string(),
            CidxError::Serde(_) => "malformed request payload".to_string(),
            CidxError::Corruption(_) => "index is corrupt and will be rebuilt".to_string(),
            CidxError::LockTimeout(_) => "collection is busy, try again".to_string(),
            CidxError::Cancelled => "operation was cancelled".to_string(),
            CidxError::Internal(_) => "internal error".to_string(),
        }
    }

    /// Whether this error should be logged at `error` (vs `warn` for
    /// client-caused errors). See SPEC_FULL.md §7 Logging.
    pub fn is_server_fault(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Io | ErrorKind::Corruption | ErrorKind::Internal | ErrorKind::Network
        )
    }
}
