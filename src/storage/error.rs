//! Storage Isolation Error Types
//!
//! This module defines all error types that can occur while redirecting the
//! shared path into an isolated area and back.

use std::io;
use std::path::PathBuf;

/// Result type alias for isolation operations
pub type IsolationResult<T> = Result<T, IsolationError>;

/// Error types for isolation operations
#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    /// The isolated area could not be created
    #[error("Failed to provision isolated area '{}': {source}", path.display())]
    Provision {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The platform link call failed
    #[error("Failed to create redirect '{}' -> '{}': {source}", link.display(), target.display())]
    Redirect {
        link: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The redirect artifact could not be removed
    #[error("Failed to remove redirect '{}': {source}", link.display())]
    RedirectRemoval {
        link: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Acquisition attempted while another identity holds the shared path
    #[error("Shared path is already isolated for '{active}', refusing to isolate '{requested}'")]
    RegistryConflict { active: String, requested: String },

    /// Shared path does not match the declared state
    #[error("Invariant violation on '{}': {reason}", path.display())]
    InvariantViolation { path: PathBuf, reason: String },

    /// Backup capture failed
    #[error("Failed to capture backup of '{}': {source}", path.display())]
    Capture {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Original content could not be moved aside
    #[error("Failed to vacate '{}': {source}", path.display())]
    Vacate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Backup restore failed
    #[error("Failed to restore backup '{}': {source}", snapshot.display())]
    Restore {
        snapshot: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Restore attempted over a path that is not vacant
    #[error("Refusing to restore over '{}': path is still occupied", path.display())]
    RestoreTargetOccupied { path: PathBuf },

    /// A previous isolation still has content to restore
    #[error("Isolation of '{identity}' was not fully released (journal '{}'), a sweep must recover it first", journal.display())]
    PendingRecovery { identity: String, journal: PathBuf },

    /// The blocking storage task did not finish
    #[error("Storage task for '{identity}' did not complete: {message}")]
    Interrupted { identity: String, message: String },

    /// Journal could not be read or written
    #[error("Isolation journal error at '{}': {message}", path.display())]
    Journal { path: PathBuf, message: String },

    /// Other I/O failure
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl IsolationError {
    /// Whether the failure may go away on a later attempt
    ///
    /// Filesystem failures during provisioning, capture and linking are
    /// transient under concurrent activity. Conflicts, invariant violations
    /// and unrestored backups leave global state needing repair and are
    /// never retried.
    pub fn is_retryable(&self) -> bool {
        !self.requires_reconciliation()
    }

    /// Whether this failure means global state must be reconciled before
    /// another identity is processed
    pub fn requires_reconciliation(&self) -> bool {
        matches!(
            self,
            Self::RegistryConflict { .. }
                | Self::InvariantViolation { .. }
                | Self::PendingRecovery { .. }
                | Self::Restore { .. }
                | Self::RestoreTargetOccupied { .. }
                | Self::Interrupted { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invariant(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
