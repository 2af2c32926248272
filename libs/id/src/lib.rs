//! # virtops-id
//!
//! Identity types for objects held in the virtops object store.
//!
//! ## Design Principles
//!
//! - Names are user-controlled; UIDs are system-generated and never reused
//! - UIDs have a canonical string form with strict parsing
//! - Resource versions order writes to a single object and drive
//!   optimistic concurrency
//! - Generations only move when an object's spec changes
//!
//! ## UID Format
//!
//! UIDs use a prefixed format, `uid_{ulid}`, for example
//! `uid_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//!
//! The ULID keeps UIDs time-ordered, which the controllers rely on when
//! deriving stable names such as `tmp-snapshot-<uid>`.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

#[doc(hidden)]
pub use ulid::Ulid;
