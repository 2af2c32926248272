//! Admission checks for restores, clones and VM start requests.
//!
//! These run synchronously in the caller before anything is written; a
//! rejected request leaves the store untouched.

use thiserror::Error;
use tracing::{debug, info};
use virtops_api::{
    Api, PersistentVolumeClaim, Resource, StorageClass, StoreError, VirtualMachine,
    VirtualMachineClone, VirtualMachineRestore, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent,
};

use crate::clone::filter::{FilterError, KeyFilter};
use crate::context::Context;

pub const VIRTUAL_MACHINE_KIND: &str = "VirtualMachine";
pub const SNAPSHOT_KIND: &str = "VirtualMachineSnapshot";

/// A request refused at admission.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("VirtualMachine \"{0}\" is not stopped")]
    VmNotStopped(String),

    #[error("VirtualMachineSnapshot \"{0}\" does not exist")]
    SnapshotNotFound(String),

    #[error("VirtualMachineSnapshot \"{0}\" is not ready to use")]
    SnapshotNotReady(String),

    #[error("VirtualMachineRestore \"{0}\" in progress")]
    RestoreInProgress(String),

    #[error("Cannot start VM until restore \"{0}\" completes")]
    StartBlocked(String),

    #[error("volume \"{volume}\" uses storage class \"{storage_class}\" which does not support snapshots")]
    SnapshotUnsupported {
        volume: String,
        storage_class: String,
    },

    #[error("volume \"{volume}\" of VirtualMachine \"{vm}\" is not backed up in snapshot \"{snapshot}\"")]
    VolumeNotBackedUp {
        volume: String,
        vm: String,
        snapshot: String,
    },

    #[error("source kind {0:?} is not supported, expected VirtualMachine or VirtualMachineSnapshot")]
    InvalidSourceKind(String),

    #[error("target kind {0:?} is not supported, expected VirtualMachine")]
    InvalidTargetKind(String),

    #[error("target VirtualMachine \"{0}\" is the clone source")]
    TargetIsSource(String),

    #[error(transparent)]
    InvalidFilter(#[from] FilterError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// =============================================================================
// Restore
// =============================================================================

/// Checks a restore request against the current state of its target and
/// snapshot.
pub async fn validate_restore(
    ctx: &Context,
    restore: &VirtualMachineRestore,
    namespace: &str,
) -> Result<(), AdmissionError> {
    let target = &restore.spec.target;
    if target.kind != VIRTUAL_MACHINE_KIND {
        return Err(AdmissionError::InvalidTargetKind(target.kind.clone()));
    }

    let vms: Api<VirtualMachine> = ctx.api(namespace);
    if let Some(vm) = vms.get_opt(&target.name).await? {
        if vm.is_run_requested() {
            return Err(AdmissionError::VmNotStopped(vm.name().to_string()));
        }
    }

    let snapshot_name = &restore.spec.virtual_machine_snapshot_name;
    let snapshots: Api<VirtualMachineSnapshot> = ctx.api(namespace);
    let snapshot = snapshots
        .get_opt(snapshot_name)
        .await?
        .ok_or_else(|| AdmissionError::SnapshotNotFound(snapshot_name.clone()))?;
    if !snapshot.is_ready_to_use() {
        return Err(AdmissionError::SnapshotNotReady(snapshot_name.clone()));
    }

    let restores: Api<VirtualMachineRestore> = ctx.api(namespace);
    if let Some(other) = restores.list().await?.into_iter().find(|r| {
        r.spec.target.name == target.name && r.is_pending() && r.name() != restore.name()
    }) {
        return Err(AdmissionError::RestoreInProgress(other.name().to_string()));
    }

    Ok(())
}

/// Validates and creates a restore.
pub async fn create_restore(
    ctx: &Context,
    namespace: &str,
    restore: &VirtualMachineRestore,
) -> Result<VirtualMachineRestore, AdmissionError> {
    validate_restore(ctx, restore, namespace).await?;
    let created = ctx.api::<VirtualMachineRestore>(namespace).create(restore).await?;
    info!(
        restore = %created.name(),
        target = %created.spec.target.name,
        snapshot = %created.spec.virtual_machine_snapshot_name,
        "Admitted restore"
    );
    Ok(created)
}

// =============================================================================
// Clone
// =============================================================================

/// Checks the shape of a clone and, where the source already exists, that
/// it can be snapshotted or restored. Missing sources are allowed; the
/// clone controller waits for them.
pub async fn validate_clone(
    ctx: &Context,
    clone: &VirtualMachineClone,
    namespace: &str,
) -> Result<(), AdmissionError> {
    let spec = &clone.spec;
    let source = &spec.source;
    if source.kind != VIRTUAL_MACHINE_KIND && source.kind != SNAPSHOT_KIND {
        return Err(AdmissionError::InvalidSourceKind(source.kind.clone()));
    }

    if let Some(target) = &spec.target {
        if target.kind != VIRTUAL_MACHINE_KIND {
            return Err(AdmissionError::InvalidTargetKind(target.kind.clone()));
        }
        if source.kind == VIRTUAL_MACHINE_KIND && target.name == source.name {
            return Err(AdmissionError::TargetIsSource(target.name.clone()));
        }
    }

    for filters in [
        &spec.label_filters,
        &spec.annotation_filters,
        &spec.template.label_filters,
        &spec.template.annotation_filters,
    ] {
        KeyFilter::parse(filters)?;
    }

    if source.kind == VIRTUAL_MACHINE_KIND {
        let vms: Api<VirtualMachine> = ctx.api(namespace);
        if let Some(vm) = vms.get_opt(&source.name).await? {
            check_snapshot_support(ctx, namespace, &vm).await?;
        }
    } else {
        check_backed_up(ctx, namespace, &source.name).await?;
    }

    Ok(())
}

/// Validates and creates a clone.
pub async fn create_clone(
    ctx: &Context,
    namespace: &str,
    clone: &VirtualMachineClone,
) -> Result<VirtualMachineClone, AdmissionError> {
    validate_clone(ctx, clone, namespace).await?;
    let created = ctx.api::<VirtualMachineClone>(namespace).create(clone).await?;
    info!(
        clone = %created.name(),
        source_kind = %created.spec.source.kind,
        source = %created.spec.source.name,
        "Admitted clone"
    );
    Ok(created)
}

/// Every persistent volume of `vm` must sit on a snapshot-capable class.
/// Claims that do not exist yet are not judged.
async fn check_snapshot_support(
    ctx: &Context,
    namespace: &str,
    vm: &VirtualMachine,
) -> Result<(), AdmissionError> {
    let claims: Api<PersistentVolumeClaim> = ctx.api(namespace);
    let classes: Api<StorageClass> = ctx.cluster_api();

    for (volume, claim_name) in vm.spec.persistent_claims() {
        let Some(claim) = claims.get_opt(claim_name).await? else {
            debug!(volume, claim = claim_name, "Claim not found, skipping snapshot check");
            continue;
        };
        let Some(class_name) = claim.spec.storage_class_name.as_deref() else {
            continue;
        };
        let supported = classes
            .get_opt(class_name)
            .await?
            .is_some_and(|sc| sc.snapshot_supported);
        if !supported {
            return Err(AdmissionError::SnapshotUnsupported {
                volume: volume.to_string(),
                storage_class: class_name.to_string(),
            });
        }
    }
    Ok(())
}

/// A ready snapshot's content must hold a backup for every persistent
/// volume of the captured VM.
async fn check_backed_up(
    ctx: &Context,
    namespace: &str,
    snapshot_name: &str,
) -> Result<(), AdmissionError> {
    let snapshots: Api<VirtualMachineSnapshot> = ctx.api(namespace);
    let Some(snapshot) = snapshots.get_opt(snapshot_name).await? else {
        return Ok(());
    };
    let Some(content_name) = snapshot.status.virtual_machine_snapshot_content_name.as_deref()
    else {
        return Ok(());
    };
    let contents: Api<VirtualMachineSnapshotContent> = ctx.api(namespace);
    let Some(content) = contents.get_opt(content_name).await? else {
        return Ok(());
    };

    if let Some(volume) = missing_backup(&content) {
        return Err(AdmissionError::VolumeNotBackedUp {
            volume,
            vm: content.spec.source.virtual_machine.name.clone(),
            snapshot: snapshot_name.to_string(),
        });
    }
    Ok(())
}

/// First persistent volume of the captured VM without a backup.
pub(crate) fn missing_backup(content: &VirtualMachineSnapshotContent) -> Option<String> {
    content
        .spec
        .source
        .virtual_machine
        .spec
        .persistent_claims()
        .into_iter()
        .find(|(volume, _)| content.backup_for(volume).is_none())
        .map(|(volume, _)| volume.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use rstest::rstest;
    use virtops_api::{
        CapturedVirtualMachine, ClaimSource, Conditions, SqliteStore, TypedLocalObjectReference,
        VirtualMachineSpec, Volume, VolumeBindingMode, VolumeSource,
    };
    use virtops_events::MemoryRecorder;

    const NS: &str = "default";

    fn ctx() -> Context {
        Context::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(MemoryRecorder::new()),
        )
    }

    fn spec_with_claim(claim: &str) -> VirtualMachineSpec {
        let mut spec = VirtualMachineSpec::default();
        spec.template.spec.volumes.push(Volume {
            name: "disk0".to_string(),
            source: VolumeSource::PersistentVolumeClaim(ClaimSource {
                claim_name: claim.to_string(),
            }),
        });
        spec
    }

    async fn ready_snapshot(ctx: &Context, name: &str) {
        let snaps: Api<VirtualMachineSnapshot> = ctx.api(NS);
        let mut snap = snaps
            .create(&VirtualMachineSnapshot::new(NS, name, "vm-a"))
            .await
            .unwrap();
        snap.status.ready_to_use = true;
        snaps.replace_status(&snap).await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_rejected_for_running_vm() {
        let ctx = ctx();
        let mut vm = VirtualMachine::new(NS, "vm-a", VirtualMachineSpec::default());
        vm.spec.running = Some(true);
        ctx.api::<VirtualMachine>(NS).create(&vm).await.unwrap();
        ready_snapshot(&ctx, "snap-a").await;

        let err = create_restore(&ctx, NS, &VirtualMachineRestore::new(NS, "r1", "vm-a", "snap-a"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "VirtualMachine \"vm-a\" is not stopped");
        assert!(ctx.api::<VirtualMachineRestore>(NS).get_opt("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_rejected_for_missing_snapshot() {
        let ctx = ctx();
        let err = create_restore(&ctx, NS, &VirtualMachineRestore::new(NS, "r1", "vm-a", "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "VirtualMachineSnapshot \"nope\" does not exist");
    }

    #[tokio::test]
    async fn test_restore_rejected_for_unready_snapshot() {
        let ctx = ctx();
        ctx.api::<VirtualMachineSnapshot>(NS)
            .create(&VirtualMachineSnapshot::new(NS, "snap-a", "vm-a"))
            .await
            .unwrap();
        let err = create_restore(&ctx, NS, &VirtualMachineRestore::new(NS, "r1", "vm-a", "snap-a"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "VirtualMachineSnapshot \"snap-a\" is not ready to use");
    }

    #[tokio::test]
    async fn test_second_restore_rejected_while_first_in_progress() {
        let ctx = ctx();
        ready_snapshot(&ctx, "snap-a").await;
        create_restore(&ctx, NS, &VirtualMachineRestore::new(NS, "r1", "vm-a", "snap-a"))
            .await
            .unwrap();
        let err = create_restore(&ctx, NS, &VirtualMachineRestore::new(NS, "r2", "vm-a", "snap-a"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "VirtualMachineRestore \"r1\" in progress");
    }

    #[tokio::test]
    async fn test_failed_restore_does_not_block_new_restore() {
        let ctx = ctx();
        ready_snapshot(&ctx, "snap-a").await;
        let mut failed = create_restore(&ctx, NS, &VirtualMachineRestore::new(NS, "r1", "vm-a", "snap-a"))
            .await
            .unwrap();
        failed.status.conditions = Some(Conditions::transition(None, false, false, "Failed"));
        ctx.api::<VirtualMachineRestore>(NS)
            .replace_status(&failed)
            .await
            .unwrap();

        create_restore(&ctx, NS, &VirtualMachineRestore::new(NS, "r2", "vm-a", "snap-a"))
            .await
            .unwrap();
    }

    #[rstest]
    #[case("Pod", "vm-b", "source kind")]
    #[case("VirtualMachine", "vm-a", "is the clone source")]
    #[tokio::test]
    async fn test_clone_shape_rejected(
        #[case] source_kind: &str,
        #[case] target: &str,
        #[case] expected: &str,
    ) {
        let ctx = ctx();
        let clone = VirtualMachineClone::new(
            NS,
            "c1",
            TypedLocalObjectReference::new(source_kind, "vm-a"),
            target,
        );
        let err = create_clone(&ctx, NS, &clone).await.unwrap_err();
        assert!(err.to_string().contains(expected), "{err}");
    }

    #[tokio::test]
    async fn test_clone_rejects_bad_filter() {
        let ctx = ctx();
        let mut clone = VirtualMachineClone::new(
            NS,
            "c1",
            TypedLocalObjectReference::new(VIRTUAL_MACHINE_KIND, "vm-a"),
            "vm-b",
        );
        clone.spec.label_filters = vec!["[".to_string()];
        assert!(matches!(
            create_clone(&ctx, NS, &clone).await.unwrap_err(),
            AdmissionError::InvalidFilter(_)
        ));
    }

    #[tokio::test]
    async fn test_clone_of_missing_source_is_admitted() {
        let ctx = ctx();
        let clone = VirtualMachineClone::new(
            NS,
            "c1",
            TypedLocalObjectReference::new(VIRTUAL_MACHINE_KIND, "later"),
            "vm-b",
        );
        assert!(create_clone(&ctx, NS, &clone).await.is_ok());
    }

    #[tokio::test]
    async fn test_clone_rejects_storage_without_snapshots() {
        let ctx = ctx();
        ctx.cluster_api::<StorageClass>()
            .create(&StorageClass::new("local", VolumeBindingMode::Immediate, false))
            .await
            .unwrap();
        ctx.api::<PersistentVolumeClaim>(NS)
            .create(&PersistentVolumeClaim::new(NS, "pvc-a", Some("local".to_string())))
            .await
            .unwrap();
        ctx.api::<VirtualMachine>(NS)
            .create(&VirtualMachine::new(NS, "vm-a", spec_with_claim("pvc-a")))
            .await
            .unwrap();

        let clone = VirtualMachineClone::new(
            NS,
            "c1",
            TypedLocalObjectReference::new(VIRTUAL_MACHINE_KIND, "vm-a"),
            "vm-b",
        );
        let err = create_clone(&ctx, NS, &clone).await.unwrap_err();
        assert!(err.to_string().contains("does not support snapshots"), "{err}");
    }

    #[tokio::test]
    async fn test_clone_rejects_snapshot_missing_backup() {
        let ctx = ctx();
        let contents: Api<VirtualMachineSnapshotContent> = ctx.api(NS);
        let mut content = VirtualMachineSnapshotContent::default();
        content.metadata = virtops_api::ObjectMeta::named(NS, "content-a");
        content.spec.virtual_machine_snapshot_name = "snap-a".to_string();
        content.spec.source.virtual_machine = CapturedVirtualMachine {
            name: "vm-a".to_string(),
            spec: spec_with_claim("pvc-a"),
            ..Default::default()
        };
        contents.create(&content).await.unwrap();

        let snaps: Api<VirtualMachineSnapshot> = ctx.api(NS);
        let mut snap = snaps
            .create(&VirtualMachineSnapshot::new(NS, "snap-a", "vm-a"))
            .await
            .unwrap();
        snap.status.ready_to_use = true;
        snap.status.virtual_machine_snapshot_content_name = Some("content-a".to_string());
        snaps.replace_status(&snap).await.unwrap();

        let clone = VirtualMachineClone::new(
            NS,
            "c1",
            TypedLocalObjectReference::new(SNAPSHOT_KIND, "snap-a"),
            "vm-b",
        );
        let err = create_clone(&ctx, NS, &clone).await.unwrap_err();
        assert!(err.to_string().contains("not backed up in snapshot"), "{err}");
    }
}
