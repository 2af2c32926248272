//! Identity parsing errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    #[error("expected prefix {expected:?}, got {actual:?}")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// No `_` between prefix and ULID.
    #[error("identifier has no '_' separator")]
    MissingSeparator,

    #[error("malformed ULID: {0}")]
    InvalidUlid(String),

    /// Resource versions are non-negative decimal integers.
    #[error("malformed resource version {0:?}")]
    InvalidResourceVersion(String),
}
