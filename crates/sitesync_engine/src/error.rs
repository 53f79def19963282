//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (invalid message format or sequence).
    ///
    /// Fatal to the connection: a frame that fails to decode is never
    /// partially processed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Codec error while decoding a frame.
    #[error("codec error: {0}")]
    Codec(#[from] sitesync_codec::CodecError),

    /// Change store error during pull or apply.
    #[error("store error: {0}")]
    Store(String),

    /// The requested schema conflicts with the store's schema.
    #[error("schema conflict for schema {schema_name:?}")]
    SchemaConflict {
        /// Name of the conflicting schema.
        schema_name: String,
    },

    /// Not connected to the peer.
    #[error("not connected to peer")]
    NotConnected,

    /// Operation on a stopped stream or closed session.
    #[error("stream is stopped")]
    Stopped,

    /// Protocol-state bug; never silently corrected.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns true if this error must tear the connection down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Protocol(_)
                | SyncError::Codec(_)
                | SyncError::SchemaConflict { .. }
                | SyncError::InvariantViolation(_)
        )
    }
}
