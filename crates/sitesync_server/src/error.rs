//! Error types for the sync server.

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A connection requested a schema that conflicts with the cached
    /// handle's schema. Fatal to the requesting connection only.
    #[error("schema mismatch for {db_name:?}: cached {cached}, requested {requested}")]
    SchemaMismatch {
        /// Logical database name.
        db_name: String,
        /// Schema already bound to the cached handle (`name@version`).
        cached: String,
        /// Schema the connection asked for (`name@version`).
        requested: String,
    },

    /// No cached handle for the named database.
    #[error("unknown database: {0:?}")]
    UnknownDatabase(String),

    /// Protocol-state bug (ref count below zero, double establish).
    /// Fails loudly; never silently corrected.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Error from the sync engine or store.
    #[error("sync error: {0}")]
    Sync(#[from] sitesync_engine::SyncError),
}

impl ServerError {
    /// Returns true if the requesting client caused this error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::SchemaMismatch { .. }
                | ServerError::UnknownDatabase(_)
        )
    }

    /// Returns true if this indicates a server-side bug.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, ServerError::InvariantViolation(_))
    }
}
