//! Log error types.

use std::path::Path;
use thiserror::Error;

/// Result type alias for log operations.
pub type Result<T> = std::result::Result<T, WalError>;

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt segment data at offset {offset}: {reason}")]
    CorruptRecord { offset: usize, reason: &'static str },

    #[error("log is corrupt")]
    Corrupt,

    #[error("index {index} out of range [{first}, {last}]")]
    OutOfRange { index: u64, first: u64, last: u64 },

    #[error("log is closed")]
    Closed,
}

impl WalError {
    /// Wraps an I/O error with the operation and path it came from.
    pub(crate) fn io(op: &str, path: &Path) -> impl FnOnce(std::io::Error) -> WalError {
        let context = format!("{} {}", op, path.display());
        move |source| WalError::Io { context, source }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalError::Io { .. })
    }

    /// Returns whether this error reports corrupt segment data.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, WalError::CorruptRecord { .. } | WalError::Corrupt)
    }
}
