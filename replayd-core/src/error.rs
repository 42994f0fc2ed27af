//! Error types for replayd.
//!
//! Errors carry stable codes and the identifiers needed to correlate a
//! failure with a specific replay state, resource, or connection.

use crate::types::{ResourceId, StateId};
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for replayd operations.
#[derive(Error, Debug)]
pub enum ReplayError {
    // =========================================================================
    // Arena errors (E010-E019)
    // =========================================================================
    /// No candidate arena size could be reserved.
    #[error("E010: failed to reserve a memory arena; smallest candidate was {smallest} bytes")]
    ArenaReserve {
        /// The smallest candidate size that was attempted.
        smallest: usize,
    },

    /// A payload does not fit inside the reserved arena.
    #[error("E011: payload for state {state} is {size} bytes, arena holds {capacity}")]
    ArenaBounds {
        /// The state whose payload was rejected.
        state: StateId,
        /// The payload size.
        size: usize,
        /// The arena capacity.
        capacity: usize,
    },

    // =========================================================================
    // Cache errors (E020-E029)
    // =========================================================================
    /// Failed to create or open an on-disk cache.
    #[error("E020: failed to open on-disk cache at {path}: {cause}")]
    CacheOpen {
        /// The cache directory.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// Failed to read or write cache storage.
    #[error("E021: cache I/O failed at {path}: {cause}")]
    CacheIo {
        /// The file that failed.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// A requested resource is not available from any loader.
    #[error("E022: resource {id} not found")]
    ResourceNotFound {
        /// The missing resource.
        id: ResourceId,
    },

    // =========================================================================
    // Context errors (E030-E039)
    // =========================================================================
    /// Context initialization failed.
    #[error("E030: context initialization for state {state} failed: {cause}")]
    ContextInitialize {
        /// The state that could not be initialized.
        state: StateId,
        /// Reason for the failure.
        cause: String,
    },

    /// Interpretation failed.
    #[error("E031: interpretation of state {state} failed: {cause}")]
    Interpret {
        /// The state being interpreted.
        state: StateId,
        /// Reason for the failure.
        cause: String,
    },

    /// Context cleanup failed. The context no longer holds a trustworthy
    /// view of shared device state.
    #[error("E032: context cleanup failed: {cause}")]
    ContextCleanup {
        /// Reason for the failure.
        cause: String,
    },

    /// An operation requires an initialized context.
    #[error("E033: context is not initialized")]
    ContextNotInitialized,

    // =========================================================================
    // Auth errors (E040-E049)
    // =========================================================================
    /// The configured auth-token file could not be read.
    #[error("E040: unable to read auth-token file {path}: {cause}")]
    AuthTokenFile {
        /// The token file path.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// The client presented a token that does not match.
    #[error("E041: authentication rejected")]
    AuthRejected,

    // =========================================================================
    // Transport errors (E050-E059)
    // =========================================================================
    /// A socket or pipe operation failed.
    #[error("E050: transport I/O failed: {cause}")]
    TransportIo {
        /// Reason for the failure.
        cause: String,
    },

    /// A wire frame could not be encoded or decoded.
    #[error("E051: frame codec error: {cause}")]
    FrameCodec {
        /// Reason for the failure.
        cause: String,
    },

    /// A frame exceeded the maximum allowed size.
    #[error("E052: frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// The declared frame size.
        size: usize,
        /// The configured limit.
        limit: usize,
    },

    // =========================================================================
    // Server errors (E060-E069)
    // =========================================================================
    /// The server could not bind its listen address.
    #[error("E060: failed to bind {addr}: {cause}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// Reason for the failure.
        cause: String,
    },

    /// An archive directory is missing a required entry.
    #[error("E061: replay archive at {path} is missing {entry}")]
    ArchiveLayout {
        /// The archive directory.
        path: PathBuf,
        /// The missing entry.
        entry: String,
    },
}

impl ReplayError {
    /// True if the failure only invalidates the current request, not the
    /// connection it arrived on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReplayError::ContextInitialize { .. }
                | ReplayError::Interpret { .. }
                | ReplayError::ResourceNotFound { .. }
        )
    }
}

/// Convenient result alias for replayd operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = ReplayError::ResourceNotFound {
            id: "tex/4".into(),
        };
        assert!(err.to_string().starts_with("E022:"));

        let err = ReplayError::ContextCleanup {
            cause: "device lost".into(),
        };
        assert!(err.to_string().starts_with("E032:"));
    }

    #[test]
    fn recoverability_split() {
        assert!(
            ReplayError::ContextInitialize {
                state: "s".into(),
                cause: "x".into(),
            }
            .is_recoverable()
        );
        assert!(
            !ReplayError::ContextCleanup {
                cause: "x".into(),
            }
            .is_recoverable()
        );
    }
}
