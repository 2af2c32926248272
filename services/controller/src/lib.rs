//! virtops controllers
//!
//! Level-triggered controllers for KubeVirt-style VM lifecycle operations,
//! all running against one object store:
//!
//! - **Snapshot engine**: captures a stopped VM and its claims into
//!   snapshot content plus one volume snapshot per claim
//! - **Restore engine**: materializes a VM from snapshot content, in place
//!   or as a new VM, applying the restore's JSON patches
//! - **Clone controller**: snapshot, restore with a new identity, then
//!   cleanup of the temporary objects
//! - **Rollout coordinator**: canary rollout of component DaemonSets when
//!   their customized template changes
//! - **Garbage collector**: owner-reference cascade deletion
//!
//! Requests that can be refused up front go through [`admission`] before
//! they reach the store.
//!
//! Every controller implements [`ReconcileLoop`] and runs inside a
//! [`Worker`]: a periodic pass over all objects of its kind that stops on a
//! shutdown signal.

pub mod admission;
pub mod clone;
pub mod config;
pub mod context;
pub mod error;
pub mod gc;
pub mod operations;
pub mod provisioner;
pub mod restore;
pub mod rollout;
pub mod snapshot;
pub mod worker;

pub use admission::AdmissionError;
pub use clone::CloneReconciler;
pub use config::{CloneConfig, Config, RolloutConfig};
pub use context::Context;
pub use error::{ControllerError, ControllerResult};
pub use gc::GarbageCollector;
pub use provisioner::MockProvisioner;
pub use restore::RestoreReconciler;
pub use rollout::{RolloutCoordinator, RolloutReconciler};
pub use snapshot::{SnapshotReconciler, StoreVolumeSnapshotter, VolumeSnapshotter};
pub use worker::{ReconcileLoop, ReconcileStats, Worker};
