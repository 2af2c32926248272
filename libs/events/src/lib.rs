//! # virtops-events
//!
//! Event records emitted by the virtops controllers.
//!
//! ## Design Principles
//!
//! - Events are user-visible signals, never the source of truth; callers
//!   poll object status for state
//! - Every event names exactly one involved object
//! - Repeated identical events aggregate into one record with a count
//!
//! ## Reasons
//!
//! Reasons are stable CamelCase identifiers (see [`reasons`]). The ones
//! external consumers match on are part of the contract, e.g.
//! `SourceDoesNotExist` on a clone whose source is not yet present.

mod error;
mod event;
mod recorder;

pub use error::EventError;
pub use event::*;
pub use recorder::*;
