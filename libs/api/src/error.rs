//! Object store errors.

use thiserror::Error;

use crate::ObjectKey;

/// Errors from object store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(ObjectKey),

    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),

    /// The caller's resourceVersion is stale; re-read and retry.
    #[error("conflict on {key}: expected resourceVersion {expected}, stored {actual}")]
    Conflict {
        key: ObjectKey,
        expected: String,
        actual: String,
    },

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("patch failed: {0}")]
    Patch(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

impl From<json_patch::PatchError> for StoreError {
    fn from(err: json_patch::PatchError) -> Self {
        StoreError::Patch(err.to_string())
    }
}
