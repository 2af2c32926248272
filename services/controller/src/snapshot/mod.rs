//! Snapshot engine.
//!
//! Captures a VM into a `VirtualMachineSnapshotContent` (a deep copy of the
//! VM plus one volume backup per persistent volume) and reports the
//! snapshot ready once every volume backup is durable.

pub mod volume;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use virtops_api::{
    Api, BackedUpClaim, CapturedVirtualMachine, ObjectMeta, PersistentVolumeClaim, Resource,
    SnapshotContentSource, SnapshotError, SnapshotPhase, StorageClass, TemplateMeta,
    VirtualMachine, VirtualMachineSnapshot, VirtualMachineSnapshotContent,
    VirtualMachineSnapshotContentSpec, VolumeBackup, STORAGE_REQUEST,
};
use virtops_events::reasons;
use virtops_reconcile::{Action, Backoff, RequeueSchedule};

use crate::context::Context;
use crate::error::{ControllerError, ControllerResult};
use crate::worker::{lock, ReconcileLoop, ReconcileStats};

pub use volume::{StoreVolumeSnapshotter, VolumeSnapshotState, VolumeSnapshotter};

/// Reconciles every snapshot in one namespace.
pub struct SnapshotReconciler {
    ctx: Context,
    namespace: String,
    snapshotter: Arc<dyn VolumeSnapshotter>,
    backoff: Mutex<Backoff>,
    schedule: Mutex<RequeueSchedule>,
}

impl SnapshotReconciler {
    pub fn new(
        ctx: Context,
        namespace: impl Into<String>,
        snapshotter: Arc<dyn VolumeSnapshotter>,
    ) -> Self {
        Self {
            ctx,
            namespace: namespace.into(),
            snapshotter,
            backoff: Mutex::new(Backoff::default()),
            schedule: Mutex::new(RequeueSchedule::new()),
        }
    }

    fn snapshots(&self) -> Api<VirtualMachineSnapshot> {
        self.ctx.api(&self.namespace)
    }

    fn contents(&self) -> Api<VirtualMachineSnapshotContent> {
        self.ctx.api(&self.namespace)
    }

    #[instrument(skip(self, snapshot), fields(snapshot = %snapshot.name()))]
    pub async fn reconcile(&self, snapshot: &VirtualMachineSnapshot) -> ControllerResult<Action> {
        if snapshot.is_ready_to_use() || snapshot.is_failed() {
            return Ok(Action::AwaitChange);
        }

        let uid = snapshot.metadata.uid.ok_or_else(|| {
            ControllerError::invalid(VirtualMachineSnapshot::KIND, snapshot.name(), "object has no uid")
        })?;
        let content_name = snapshot
            .status
            .virtual_machine_snapshot_content_name
            .clone()
            .unwrap_or_else(|| format!("vmsnapshot-content-{}", uid.short()));

        match self.contents().get_opt(&content_name).await? {
            Some(content) => self.await_volumes(snapshot, content).await,
            None => self.capture(snapshot, &content_name, &uid.short()).await,
        }
    }

    /// Writes the content object for the source VM as it is now.
    async fn capture(
        &self,
        snapshot: &VirtualMachineSnapshot,
        content_name: &str,
        suffix: &str,
    ) -> ControllerResult<Action> {
        let source_name = &snapshot.spec.source.name;
        let vms: Api<VirtualMachine> = self.ctx.api(&self.namespace);
        let Some(vm) = vms.get_opt(source_name).await? else {
            self.ctx.recorder().normal(
                &snapshot.object_ref(),
                reasons::SOURCE_DOES_NOT_EXIST,
                &format!("source VirtualMachine {source_name:?} does not exist"),
            );
            let delay = lock(&self.backoff).next_delay(snapshot.name());
            return Ok(Action::Requeue(delay));
        };
        lock(&self.backoff).reset(snapshot.name());

        let claims: Api<PersistentVolumeClaim> = self.ctx.api(&self.namespace);
        let classes: Api<StorageClass> = self.ctx.cluster_api();
        let mut backups = Vec::new();
        for (volume, claim_name) in vm.spec.persistent_claims() {
            let Some(claim) = claims.get_opt(claim_name).await? else {
                debug!(volume, claim = claim_name, "Waiting for claim to exist");
                return Ok(Action::AwaitChange);
            };

            if let Some(class_name) = claim.spec.storage_class_name.as_deref() {
                let supported = classes
                    .get_opt(class_name)
                    .await?
                    .is_some_and(|sc| sc.snapshot_supported);
                if !supported {
                    let message = format!(
                        "volume {volume:?} uses storage class {class_name:?} which does not support snapshots"
                    );
                    return self.fail(snapshot, &message).await;
                }
            }

            backups.push(VolumeBackup {
                volume_name: volume.to_string(),
                persistent_volume_claim: BackedUpClaim {
                    name: claim_name.to_string(),
                    storage_class_name: claim.spec.storage_class_name.clone(),
                    size: claim.spec.resources.requests.get(STORAGE_REQUEST).cloned(),
                },
                volume_snapshot_name: Some(format!("vmsnapshot-{suffix}-volume-{volume}")),
            });
        }

        let owner = snapshot.controller_ref().ok_or_else(|| {
            ControllerError::invalid(VirtualMachineSnapshot::KIND, snapshot.name(), "object has no uid")
        })?;
        let content = VirtualMachineSnapshotContent {
            metadata: ObjectMeta::named(&self.namespace, content_name).with_owner(owner),
            spec: VirtualMachineSnapshotContentSpec {
                virtual_machine_snapshot_name: snapshot.name().to_string(),
                source: SnapshotContentSource {
                    virtual_machine: CapturedVirtualMachine {
                        name: vm.name().to_string(),
                        metadata: TemplateMeta {
                            labels: vm.metadata.labels.clone(),
                            annotations: vm.metadata.annotations.clone(),
                        },
                        spec: vm.spec.clone(),
                    },
                },
                volume_backups: backups,
            },
            status: Default::default(),
        };
        let volumes = content.spec.volume_backups.len();
        self.contents().create(&content).await?;
        self.ctx.recorder().normal(
            &snapshot.object_ref(),
            reasons::SNAPSHOT_CONTENT_CREATED,
            &format!("captured VirtualMachine {source_name:?} into {content_name:?}"),
        );
        info!(content = content_name, volumes, "Captured VirtualMachine");

        let mut next = snapshot.clone();
        next.status.phase = Some(SnapshotPhase::InProgress);
        next.status.virtual_machine_snapshot_content_name = Some(content_name.to_string());
        next.status.source_uid = vm.metadata.uid;
        self.snapshots().replace_status(&next).await?;
        Ok(Action::AwaitChange)
    }

    /// Starts missing volume snapshots and flips readiness once all are
    /// durable: content first, then the snapshot.
    async fn await_volumes(
        &self,
        snapshot: &VirtualMachineSnapshot,
        content: VirtualMachineSnapshotContent,
    ) -> ControllerResult<Action> {
        let claims: Api<PersistentVolumeClaim> = self.ctx.api(&self.namespace);
        let mut pending = 0usize;

        for backup in &content.spec.volume_backups {
            let Some(vs_name) = backup.volume_snapshot_name.as_deref() else {
                continue;
            };
            match self.snapshotter.state(&self.namespace, vs_name).await? {
                Some(VolumeSnapshotState::Ready) => {}
                Some(VolumeSnapshotState::Pending) => pending += 1,
                Some(VolumeSnapshotState::Failed(error)) => {
                    let message = format!(
                        "snapshot of volume {:?} failed: {error}",
                        backup.volume_name
                    );
                    return self.fail(snapshot, &message).await;
                }
                None => {
                    let claim_name = &backup.persistent_volume_claim.name;
                    let Some(claim) = claims.get_opt(claim_name).await? else {
                        let message = format!("claim {claim_name:?} was deleted before it was snapshotted");
                        return self.fail(snapshot, &message).await;
                    };
                    let owner = content.controller_ref().ok_or_else(|| {
                        ControllerError::invalid(
                            VirtualMachineSnapshotContent::KIND,
                            content.name(),
                            "object has no uid",
                        )
                    })?;
                    self.snapshotter
                        .create(&self.namespace, vs_name, &claim, owner)
                        .await?;
                    pending += 1;
                }
            }
        }

        if pending > 0 {
            debug!(pending, "Waiting for volume snapshots");
            return Ok(Action::AwaitChange);
        }

        let now = Utc::now();
        if !content.status.ready_to_use {
            let mut ready = content.clone();
            ready.status.ready_to_use = true;
            ready.status.creation_time = Some(now);
            self.contents().replace_status(&ready).await?;
        }

        let mut next = snapshot.clone();
        next.status.phase = Some(SnapshotPhase::Succeeded);
        next.status.ready_to_use = true;
        next.status.creation_time = Some(now);
        next.status.virtual_machine_snapshot_content_name = Some(content.name().to_string());
        self.snapshots().replace_status(&next).await?;
        self.ctx.recorder().normal(
            &snapshot.object_ref(),
            reasons::SNAPSHOT_READY,
            &format!("snapshot ready with {} volume backups", content.spec.volume_backups.len()),
        );
        info!("Snapshot ready");
        Ok(Action::AwaitChange)
    }

    async fn fail(&self, snapshot: &VirtualMachineSnapshot, message: &str) -> ControllerResult<Action> {
        let mut next = snapshot.clone();
        next.status.phase = Some(SnapshotPhase::Failed);
        next.status.ready_to_use = false;
        next.status.error = Some(SnapshotError {
            message: message.to_string(),
            time: Some(Utc::now()),
        });
        self.snapshots().replace_status(&next).await?;
        self.ctx
            .recorder()
            .warning(&snapshot.object_ref(), reasons::VOLUME_SNAPSHOT_FAILED, message);
        Ok(Action::AwaitChange)
    }
}

#[async_trait]
impl ReconcileLoop for SnapshotReconciler {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    async fn reconcile_all(&self) -> ControllerResult<ReconcileStats> {
        let snapshots = self.snapshots().list().await?;
        let mut stats = ReconcileStats::default();
        let now = Instant::now();
        lock(&self.schedule).retain_keys(snapshots.iter().map(|s| s.name()));

        for snapshot in &snapshots {
            let key = snapshot.name();
            if !lock(&self.schedule).is_due(key, now) {
                stats.deferred += 1;
                continue;
            }
            match self.reconcile(snapshot).await {
                Ok(action) => {
                    lock(&self.schedule).schedule(key, action, Instant::now());
                    stats.processed += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(snapshot = %key, error = %e, "Failed to reconcile snapshot");
                }
            }
        }
        Ok(stats)
    }
}
