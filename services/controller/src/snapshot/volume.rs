//! Volume snapshot interface and store-backed implementation.
//!
//! The snapshot engine only asks two things of the storage layer: start a
//! point-in-time copy of a claim, and report whether it is durable yet.

use async_trait::async_trait;
use tracing::{debug, info};
use virtops_api::{
    Api, ObjectMeta, OwnerReference, PersistentVolumeClaim, VolumeSnapshot, VolumeSnapshotSpec,
};

use crate::context::Context;
use crate::error::ControllerResult;

/// Progress of one volume snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSnapshotState {
    Pending,
    Ready,
    Failed(String),
}

/// Storage-side snapshot operations.
#[async_trait]
pub trait VolumeSnapshotter: Send + Sync {
    /// Start a snapshot called `name` of `claim`. Creating one that already
    /// exists is not an error.
    async fn create(
        &self,
        namespace: &str,
        name: &str,
        claim: &PersistentVolumeClaim,
        owner: OwnerReference,
    ) -> ControllerResult<()>;

    /// Current state, or `None` if no snapshot called `name` exists.
    async fn state(&self, namespace: &str, name: &str) -> ControllerResult<Option<VolumeSnapshotState>>;
}

/// Records volume snapshots as `VolumeSnapshot` objects; a provisioner
/// fills in their status.
pub struct StoreVolumeSnapshotter {
    ctx: Context,
}

impl StoreVolumeSnapshotter {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl VolumeSnapshotter for StoreVolumeSnapshotter {
    async fn create(
        &self,
        namespace: &str,
        name: &str,
        claim: &PersistentVolumeClaim,
        owner: OwnerReference,
    ) -> ControllerResult<()> {
        let api: Api<VolumeSnapshot> = self.ctx.api(namespace);
        let snapshot = VolumeSnapshot {
            metadata: ObjectMeta::named(namespace, name).with_owner(owner),
            spec: VolumeSnapshotSpec {
                persistent_volume_claim_name: claim.metadata.name.clone(),
                storage_class_name: claim.spec.storage_class_name.clone(),
            },
            status: Default::default(),
        };
        match api.create(&snapshot).await {
            Ok(_) => {
                info!(volume_snapshot = name, claim = %claim.metadata.name, "Created volume snapshot");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!(volume_snapshot = name, "Volume snapshot already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn state(&self, namespace: &str, name: &str) -> ControllerResult<Option<VolumeSnapshotState>> {
        let api: Api<VolumeSnapshot> = self.ctx.api(namespace);
        Ok(api.get_opt(name).await?.map(|vs| {
            if let Some(error) = vs.status.error {
                VolumeSnapshotState::Failed(error)
            } else if vs.status.ready_to_use {
                VolumeSnapshotState::Ready
            } else {
                VolumeSnapshotState::Pending
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use virtops_api::SqliteStore;
    use virtops_events::MemoryRecorder;
    use virtops_id::Uid;

    fn owner() -> OwnerReference {
        OwnerReference {
            kind: "VirtualMachineSnapshotContent".to_string(),
            name: "content".to_string(),
            uid: Uid::new(),
            controller: Some(true),
            block_owner_deletion: None,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_and_reports_state() {
        let ctx = Context::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(MemoryRecorder::new()),
        );
        let snapshotter = StoreVolumeSnapshotter::new(ctx.clone());
        let claim = PersistentVolumeClaim::new("default", "pvc-a", Some("fast".to_string()));

        assert_eq!(snapshotter.state("default", "vs-a").await.unwrap(), None);
        snapshotter.create("default", "vs-a", &claim, owner()).await.unwrap();
        snapshotter.create("default", "vs-a", &claim, owner()).await.unwrap();
        assert_eq!(
            snapshotter.state("default", "vs-a").await.unwrap(),
            Some(VolumeSnapshotState::Pending)
        );

        let api: Api<VolumeSnapshot> = ctx.api("default");
        let mut vs = api.get("vs-a").await.unwrap();
        assert_eq!(vs.spec.persistent_volume_claim_name, "pvc-a");
        vs.status.error = Some("no snapshot class".to_string());
        api.replace_status(&vs).await.unwrap();
        assert_eq!(
            snapshotter.state("default", "vs-a").await.unwrap(),
            Some(VolumeSnapshotState::Failed("no snapshot class".to_string()))
        );
    }
}
