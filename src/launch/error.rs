use std::time::Duration;
use thiserror::Error;

use crate::storage::IsolationError;

/// Why an identity's launch attempt failed
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Too many external processes were running for the whole admission window
    #[error("{running} processes running (limit {limit}), gave up after {waited:?}")]
    AdmissionTimeout {
        running: usize,
        limit: usize,
        waited: Duration,
    },

    #[error("storage isolation failed: {0}")]
    Isolation(#[from] IsolationError),

    #[error("no credentials for {identity}: {message}")]
    Credentials { identity: String, message: String },

    /// The external-launch collaborator reported failure
    #[error("{collaborator} failed to launch {identity}: {message}")]
    Collaborator {
        collaborator: String,
        identity: String,
        message: String,
    },

    #[error("launch of {identity} timed out after {timeout:?}")]
    LaunchTimeout { identity: String, timeout: Duration },

    /// External process never showed up within the verification window
    #[error("{identity} not verified live after {waited:?}")]
    NotVerified { identity: String, waited: Duration },
}

impl LaunchError {
    /// Storage state may be inconsistent and needs a reconciliation pass
    pub fn requires_reconciliation(&self) -> bool {
        matches!(self, Self::Isolation(e) if e.requires_reconciliation())
    }
}

pub type LaunchResult<T> = Result<T, LaunchError>;
