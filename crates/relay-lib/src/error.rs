//! Error taxonomy for the relay core

use thiserror::Error;

/// Errors raised by the watch-aggregate-stream core
#[derive(Debug, Error)]
pub enum RelayError {
    /// The unacknowledged queue is full; the session must be torn down
    #[error("unacknowledged queue is full ({capacity} entries)")]
    CapacityExceeded { capacity: usize },

    /// A cluster object could not be turned into a report
    #[error("malformed {kind} {name}: {reason}")]
    MalformedObject {
        kind: &'static str,
        name: String,
        reason: String,
    },

    /// Transport setup or send failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer's acknowledgement stream failed
    #[error("stream receive failed: {0}")]
    PeerStream(#[from] tonic::Status),

    /// A watch or channel closed underneath a running task
    #[error("{0} closed unexpectedly")]
    WatchClosed(&'static str),

    /// A session task panicked or was aborted
    #[error("session task failed: {0}")]
    TaskFailed(String),

    /// The surrounding scope was cancelled
    #[error("cancelled")]
    Cancelled,
}

impl RelayError {
    pub fn malformed(kind: &'static str, name: impl Into<String>, reason: impl Into<String>) -> Self {
        RelayError::MalformedObject {
            kind,
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error only affects a single message
    pub fn is_local(&self) -> bool {
        matches!(self, RelayError::MalformedObject { .. })
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
