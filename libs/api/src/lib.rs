//! # virtops-api
//!
//! Typed resources and the object store the virtops controllers run
//! against.
//!
//! ## Layers
//!
//! - [`ObjectStore`]: raw JSON documents with optimistic concurrency on
//!   `metadata.resourceVersion` and a change feed ([`ObjectStore::watch`])
//! - [`SqliteStore`]: the store implementation, file-backed or in-memory
//! - [`Api`]: typed handle per kind and namespace, used by every controller
//! - [`PatchBuilder`]: RFC 6902 patches, including the string-per-operation
//!   form carried by restores
//!
//! Owner references are stored verbatim; cascade deletion is the garbage
//! collector's job, not the store's.

mod api;
mod error;
mod meta;
pub mod patch;
mod resource;
mod resources;
mod store;

pub use api::Api;
pub use error::StoreError;
pub use meta::*;
pub use patch::PatchBuilder;
pub use resource::Resource;
pub use resources::*;
pub use store::{ObjectStore, SqliteStore, WatchEvent, WatchEventType};

pub use json_patch::Patch;
pub use virtops_reconcile::IntOrString;
