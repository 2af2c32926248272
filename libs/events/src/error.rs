//! Event construction errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event is missing {0}")]
    MissingField(&'static str),

    /// Reasons are CamelCase identifiers.
    #[error("invalid event reason {0:?}")]
    InvalidReason(String),
}
