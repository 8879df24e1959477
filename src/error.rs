//! Library-wide error type.

use std::io;

/// A type alias for the result of a replication operation.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for all replication operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A malformed argument or configuration value.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// An I/O failure while talking to a store or the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store endpoint could not be reached or dropped the connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// A network deadline elapsed.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The endpoint rejected the configured credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The store rejected an operation as malformed.
    #[error("malformed operation: {0}")]
    Malformed(String),

    /// The store does not implement the requested capability.
    #[error("{0} is not supported by this store")]
    Unsupported(String),

    /// Persisted state could not be interpreted.
    #[error("corrupt state: {0}")]
    Corrupt(String),

    /// A store operation failed for a reason other than the above.
    #[error("operation failed: {0}")]
    Operation(String),

    /// Shutdown was requested while the operation was waiting.
    #[error("shutdown requested")]
    Shutdown,

    /// JSON serialization of persisted state failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the retry policy should re-attempt the failed operation.
    ///
    /// Connection resets, timeouts, and raw I/O failures are worth retrying;
    /// authentication and malformed-operation errors never are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Connection(_) | Error::Timeout(_)
        )
    }
}
