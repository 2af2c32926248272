//! Controller errors.

use thiserror::Error;
use virtops_api::StoreError;
use virtops_reconcile::ReconcileError;

use crate::admission::AdmissionError;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors raised while reconciling.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// An object is malformed in a way retries cannot fix.
    #[error("invalid {kind} {name:?}: {reason}")]
    Invalid {
        kind: &'static str,
        name: String,
        reason: String,
    },
}

impl ControllerError {
    pub fn invalid(kind: &'static str, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            kind,
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Conflicts and lookups racing a deletion clear up on the next pass.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) | Self::Admission(AdmissionError::Store(e)) => {
                e.is_conflict() || e.is_not_found() || e.is_already_exists()
            }
            _ => false,
        }
    }
}
