//! Restore engine.
//!
//! Materializes a VM from snapshot content: one restored claim per volume
//! backup, then the VM itself (created, or rewritten in place), then the
//! JSON patches carried by the restore. Completion is one status write.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use virtops_api::{
    patch, Api, Conditions, ObjectMeta, OwnerReference, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PrintableStatus, Resource, ResourceRequirements,
    TypedLocalObjectReference, VirtualMachine, VirtualMachineRestore, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent, VirtualMachineSpec, VolumeRestore, VolumeSource, STORAGE_REQUEST,
};
use virtops_events::reasons;
use virtops_reconcile::{Action, RequeueSchedule};

use crate::context::Context;
use crate::error::{ControllerError, ControllerResult};
use crate::worker::{lock, ReconcileLoop, ReconcileStats};

/// Set on a restored VM to the uid of the restore that wrote it, so a
/// repeated pass does not rewrite the VM again.
pub const LAST_RESTORE_UID_ANNOTATION: &str = "virtops.io/last-restore-uid";

/// Reconciles every restore in one namespace.
pub struct RestoreReconciler {
    ctx: Context,
    namespace: String,
    schedule: Mutex<RequeueSchedule>,
}

impl RestoreReconciler {
    pub fn new(ctx: Context, namespace: impl Into<String>) -> Self {
        Self {
            ctx,
            namespace: namespace.into(),
            schedule: Mutex::new(RequeueSchedule::new()),
        }
    }

    fn restores(&self) -> Api<VirtualMachineRestore> {
        self.ctx.api(&self.namespace)
    }

    fn vms(&self) -> Api<VirtualMachine> {
        self.ctx.api(&self.namespace)
    }

    #[instrument(skip(self, restore), fields(restore = %restore.name(), target = %restore.spec.target.name))]
    pub async fn reconcile(&self, restore: &VirtualMachineRestore) -> ControllerResult<Action> {
        if restore.is_complete() || restore.is_failed() {
            return Ok(Action::AwaitChange);
        }
        let uid = restore.metadata.uid.ok_or_else(|| {
            ControllerError::invalid(VirtualMachineRestore::KIND, restore.name(), "object has no uid")
        })?;
        let marker = uid.to_string();
        let target_name = restore.spec.target.name.as_str();
        let existing = self.vms().get_opt(target_name).await?;

        if let Some(vm) = &existing {
            let already_restored = vm.metadata.annotations.get(LAST_RESTORE_UID_ANNOTATION) == Some(&marker);
            let stopped = !vm.is_run_requested() && vm.status.printable_status == PrintableStatus::Stopped;
            if !stopped && !already_restored {
                self.ctx.recorder().normal(
                    &restore.object_ref(),
                    reasons::RESTORE_WAITING_FOR_STOP,
                    &format!("waiting for VirtualMachine {target_name:?} to stop"),
                );
                self.progress(restore, "Waiting for target to stop").await?;
                return Ok(Action::AwaitChange);
            }
        }

        let snapshot_name = &restore.spec.virtual_machine_snapshot_name;
        let snapshots: Api<VirtualMachineSnapshot> = self.ctx.api(&self.namespace);
        let snapshot = snapshots.get_opt(snapshot_name).await?;
        if let Some(snapshot) = snapshot.as_ref().filter(|s| s.is_failed()) {
            let message = format!(
                "snapshot {snapshot_name:?} failed: {}",
                snapshot.status.error.as_ref().map(|e| e.message.as_str()).unwrap_or_default()
            );
            return self.fail(restore, &message).await;
        }
        let content = match snapshot.as_ref().filter(|s| s.is_ready_to_use()) {
            Some(s) => match s.status.virtual_machine_snapshot_content_name.as_deref() {
                Some(name) => {
                    self.ctx
                        .api::<VirtualMachineSnapshotContent>(&self.namespace)
                        .get_opt(name)
                        .await?
                }
                None => None,
            },
            None => None,
        };
        let Some(content) = content.filter(|c| c.status.ready_to_use) else {
            debug!(snapshot = %snapshot_name, "Waiting for snapshot content");
            self.progress(restore, "Waiting for snapshot").await?;
            return Ok(Action::AwaitChange);
        };

        let suffix = uid.short();
        let restores = planned_restores(&content, &suffix);

        let vm = match existing {
            Some(vm) if vm.metadata.annotations.get(LAST_RESTORE_UID_ANNOTATION) == Some(&marker) => vm,
            existing => {
                let existing = self.mark_in_progress(restore, existing).await?;
                let deleted = self.materialize(restore, &content, &restores, existing, &marker).await?;
                self.delete_data_volumes(restore, &deleted).await?;
                self.vms().get(target_name).await?
            }
        };

        let owner = vm.controller_ref().ok_or_else(|| {
            ControllerError::invalid(VirtualMachine::KIND, vm.name(), "object has no uid")
        })?;
        self.ensure_claims(&content, &restores, owner).await?;

        self.clear_in_progress(&vm, restore.name()).await?;
        self.complete(restore, &content, restores).await?;
        Ok(Action::AwaitChange)
    }

    /// Creates or rewrites the target VM. Returns the DataVolumes the old
    /// spec owned that the restored spec no longer references.
    async fn materialize(
        &self,
        restore: &VirtualMachineRestore,
        content: &VirtualMachineSnapshotContent,
        restores: &[VolumeRestore],
        existing: Option<VirtualMachine>,
        marker: &str,
    ) -> ControllerResult<Vec<String>> {
        let captured = &content.spec.source.virtual_machine;
        let spec = rewire_volumes(&captured.spec, restores);
        let target_name = &restore.spec.target.name;

        let (base, deleted) = match &existing {
            Some(vm) => {
                let mut next = vm.clone();
                next.spec = spec;
                let kept: BTreeSet<&str> = next
                    .spec
                    .data_volume_templates
                    .iter()
                    .map(|t| t.name.as_str())
                    .collect();
                let deleted = vm
                    .spec
                    .data_volume_templates
                    .iter()
                    .filter(|t| !kept.contains(t.name.as_str()))
                    .map(|t| t.name.clone())
                    .collect();
                (next, deleted)
            }
            None => {
                let mut vm = VirtualMachine::new(&self.namespace, target_name, spec);
                vm.metadata.labels = captured.metadata.labels.clone();
                vm.metadata.annotations = captured.metadata.annotations.clone();
                vm.status.restore_in_progress = Some(restore.name().to_string());
                (vm, Vec::new())
            }
        };

        let mut doc = serde_json::to_value(&base).map_err(virtops_api::StoreError::from)?;
        if let Err(e) = patch::apply_patch_strings(&mut doc, &restore.spec.patches) {
            return Err(ControllerError::invalid(
                VirtualMachineRestore::KIND,
                restore.name(),
                format!("patches do not apply: {e}"),
            ));
        }
        let mut vm: VirtualMachine =
            serde_json::from_value(doc).map_err(virtops_api::StoreError::from)?;
        vm.metadata
            .annotations
            .insert(LAST_RESTORE_UID_ANNOTATION.to_string(), marker.to_string());

        if existing.is_some() {
            self.vms().replace(&vm).await?;
            info!(patches = restore.spec.patches.len(), "Restored VirtualMachine in place");
        } else {
            self.vms().create(&vm).await?;
            info!(patches = restore.spec.patches.len(), "Created VirtualMachine from snapshot");
        }
        self.ctx.recorder().normal(
            &restore.object_ref(),
            reasons::VM_RESTORED,
            &format!(
                "restored VirtualMachine {target_name:?} from snapshot {:?}",
                restore.spec.virtual_machine_snapshot_name
            ),
        );
        Ok(deleted)
    }

    async fn delete_data_volumes(
        &self,
        restore: &VirtualMachineRestore,
        names: &[String],
    ) -> ControllerResult<()> {
        let claims: Api<PersistentVolumeClaim> = self.ctx.api(&self.namespace);
        for name in names {
            if claims.delete_opt(name).await? {
                self.ctx.recorder().normal(
                    &restore.object_ref(),
                    reasons::DATA_VOLUME_DELETED,
                    &format!("deleted DataVolume {name:?} no longer used by the restored VM"),
                );
            }
        }
        if !names.is_empty() {
            // Recorded now so a later pass still reports them.
            let mut next = self.restores().get(restore.name()).await?;
            next.status.deleted_data_volumes = names.to_vec();
            self.restores().replace_status(&next).await?;
        }
        Ok(())
    }

    /// Creates the restored claims, each populated from its volume snapshot
    /// and owned by the target VM.
    async fn ensure_claims(
        &self,
        content: &VirtualMachineSnapshotContent,
        restores: &[VolumeRestore],
        owner: OwnerReference,
    ) -> ControllerResult<()> {
        let claims: Api<PersistentVolumeClaim> = self.ctx.api(&self.namespace);
        for r in restores {
            if claims.get_opt(&r.persistent_volume_claim).await?.is_some() {
                continue;
            }
            let Some(backup) = content.backup_for(&r.volume_name) else {
                continue;
            };
            let mut resources = ResourceRequirements::default();
            if let Some(size) = &backup.persistent_volume_claim.size {
                resources.requests.insert(STORAGE_REQUEST.to_string(), size.clone());
            }
            let claim = PersistentVolumeClaim {
                metadata: ObjectMeta::named(&self.namespace, &r.persistent_volume_claim)
                    .with_owner(owner.clone()),
                spec: PersistentVolumeClaimSpec {
                    storage_class_name: backup.persistent_volume_claim.storage_class_name.clone(),
                    data_source: Some(TypedLocalObjectReference {
                        api_group: Some("snapshot.storage.k8s.io".to_string()),
                        kind: "VolumeSnapshot".to_string(),
                        name: r.volume_snapshot_name.clone(),
                    }),
                    resources,
                },
                status: Default::default(),
            };
            match claims.create(&claim).await {
                Ok(_) => info!(claim = %r.persistent_volume_claim, volume = %r.volume_name, "Created restored claim"),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Flags an existing target as being restored; returns the updated VM.
    async fn mark_in_progress(
        &self,
        restore: &VirtualMachineRestore,
        vm: Option<VirtualMachine>,
    ) -> ControllerResult<Option<VirtualMachine>> {
        let Some(vm) = vm else {
            return Ok(None);
        };
        if vm.status.restore_in_progress.as_deref() == Some(restore.name()) {
            return Ok(Some(vm));
        }
        let mut next = vm;
        next.status.restore_in_progress = Some(restore.name().to_string());
        Ok(Some(self.vms().replace_status(&next).await?))
    }

    async fn clear_in_progress(&self, vm: &VirtualMachine, restore_name: &str) -> ControllerResult<()> {
        if vm.status.restore_in_progress.as_deref() != Some(restore_name) {
            return Ok(());
        }
        let mut next = vm.clone();
        next.status.restore_in_progress = None;
        self.vms().replace_status(&next).await?;
        Ok(())
    }

    async fn complete(
        &self,
        restore: &VirtualMachineRestore,
        content: &VirtualMachineSnapshotContent,
        restores: Vec<VolumeRestore>,
    ) -> ControllerResult<()> {
        let mut next = self.restores().get(restore.name()).await?;
        next.status.complete = true;
        next.status.restore_time = Some(Utc::now());
        next.status.restores = restores;
        next.status.conditions = Some(Conditions::transition(
            next.status.conditions.as_ref(),
            false,
            true,
            "Operation complete",
        ));
        self.restores().replace_status(&next).await?;
        self.ctx.recorder().normal(
            &restore.object_ref(),
            reasons::RESTORE_READY,
            &format!(
                "restored {} volumes from {:?}",
                content.spec.volume_backups.len(),
                content.name()
            ),
        );
        info!("Restore complete");
        Ok(())
    }

    /// Records a wait reason; skips the write when nothing changed.
    async fn progress(&self, restore: &VirtualMachineRestore, reason: &str) -> ControllerResult<()> {
        let unchanged = restore
            .status
            .conditions
            .as_ref()
            .is_some_and(|c| c.is_progressing() && !c.is_ready() && c.ready().reason == reason);
        if unchanged {
            return Ok(());
        }
        let mut next = restore.clone();
        next.status.conditions = Some(Conditions::transition(
            restore.status.conditions.as_ref(),
            true,
            false,
            reason,
        ));
        self.restores().replace_status(&next).await?;
        Ok(())
    }

    async fn fail(&self, restore: &VirtualMachineRestore, message: &str) -> ControllerResult<Action> {
        let mut next = restore.clone();
        next.status.conditions = Some(
            Conditions::transition(restore.status.conditions.as_ref(), false, false, "Failed")
                .with_message(message),
        );
        self.restores().replace_status(&next).await?;
        self.ctx
            .recorder()
            .warning(&restore.object_ref(), reasons::RESTORE_FAILED, message);
        Ok(Action::AwaitChange)
    }
}

#[async_trait]
impl ReconcileLoop for RestoreReconciler {
    fn name(&self) -> &'static str {
        "restore"
    }

    async fn reconcile_all(&self) -> ControllerResult<ReconcileStats> {
        let restores = self.restores().list().await?;
        let mut stats = ReconcileStats::default();
        let now = Instant::now();
        lock(&self.schedule).retain_keys(restores.iter().map(|r| r.name()));

        for restore in &restores {
            let key = restore.name();
            if !lock(&self.schedule).is_due(key, now) {
                stats.deferred += 1;
                continue;
            }
            match self.reconcile(restore).await {
                Ok(action) => {
                    lock(&self.schedule).schedule(key, action, Instant::now());
                    stats.processed += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(restore = %key, error = %e, "Failed to reconcile restore");
                }
            }
        }
        Ok(stats)
    }
}

/// Restored claim name for one volume.
pub fn restored_claim_name(restore_suffix: &str, volume: &str) -> String {
    format!("restore-{restore_suffix}-{volume}")
}

/// One entry per volume backup that has a volume snapshot.
fn planned_restores(content: &VirtualMachineSnapshotContent, suffix: &str) -> Vec<VolumeRestore> {
    let spec = &content.spec.source.virtual_machine.spec;
    content
        .spec
        .volume_backups
        .iter()
        .filter_map(|backup| {
            let snapshot = backup.volume_snapshot_name.clone()?;
            let is_data_volume = spec
                .template
                .spec
                .volumes
                .iter()
                .any(|v| v.name == backup.volume_name && v.source.is_data_volume());
            let claim = restored_claim_name(suffix, &backup.volume_name);
            Some(VolumeRestore {
                volume_name: backup.volume_name.clone(),
                data_volume_name: is_data_volume.then(|| claim.clone()),
                persistent_volume_claim: claim,
                volume_snapshot_name: snapshot,
            })
        })
        .collect()
}

/// Points restored volumes at their new claims. DataVolume templates follow
/// their volume's rename.
fn rewire_volumes(spec: &VirtualMachineSpec, restores: &[VolumeRestore]) -> VirtualMachineSpec {
    let mut spec = spec.clone();
    for volume in &mut spec.template.spec.volumes {
        let Some(r) = restores.iter().find(|r| r.volume_name == volume.name) else {
            continue;
        };
        match &mut volume.source {
            VolumeSource::PersistentVolumeClaim(claim) => {
                claim.claim_name = r.persistent_volume_claim.clone();
            }
            VolumeSource::DataVolume(dv) => {
                if let Some(template) = spec
                    .data_volume_templates
                    .iter_mut()
                    .find(|t| t.name == dv.name)
                {
                    template.name = r.persistent_volume_claim.clone();
                }
                dv.name = r.persistent_volume_claim.clone();
            }
            VolumeSource::ContainerDisk(_) | VolumeSource::CloudInitNoCloud(_) => {}
        }
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtops_api::{
        BackedUpClaim, CapturedVirtualMachine, ClaimSource, DataVolumeSource, DataVolumeTemplate,
        Volume, VolumeBackup,
    };

    fn content_with(volumes: Vec<Volume>, templates: Vec<DataVolumeTemplate>) -> VirtualMachineSnapshotContent {
        let mut spec = VirtualMachineSpec::default();
        spec.data_volume_templates = templates;
        let backups = volumes
            .iter()
            .filter_map(|v| {
                v.source.claim_name().map(|c| VolumeBackup {
                    volume_name: v.name.clone(),
                    persistent_volume_claim: BackedUpClaim {
                        name: c.to_string(),
                        storage_class_name: None,
                        size: None,
                    },
                    volume_snapshot_name: Some(format!("vs-{}", v.name)),
                })
            })
            .collect();
        spec.template.spec.volumes = volumes;
        let mut content = VirtualMachineSnapshotContent::default();
        content.spec.source.virtual_machine = CapturedVirtualMachine {
            name: "vm-a".to_string(),
            spec,
            ..Default::default()
        };
        content.spec.volume_backups = backups;
        content
    }

    #[test]
    fn test_rewire_claim_and_data_volume() {
        let content = content_with(
            vec![
                Volume {
                    name: "disk0".into(),
                    source: VolumeSource::PersistentVolumeClaim(ClaimSource {
                        claim_name: "pvc-a".into(),
                    }),
                },
                Volume {
                    name: "disk1".into(),
                    source: VolumeSource::DataVolume(DataVolumeSource { name: "dv-a".into() }),
                },
            ],
            vec![DataVolumeTemplate {
                name: "dv-a".into(),
                storage_class_name: None,
                size: None,
            }],
        );

        let restores = planned_restores(&content, "r1");
        assert_eq!(restores.len(), 2);
        assert_eq!(restores[0].persistent_volume_claim, "restore-r1-disk0");
        assert!(restores[0].data_volume_name.is_none());
        assert_eq!(restores[1].data_volume_name.as_deref(), Some("restore-r1-disk1"));

        let spec = rewire_volumes(&content.spec.source.virtual_machine.spec, &restores);
        assert_eq!(
            spec.persistent_claims(),
            vec![("disk0", "restore-r1-disk0"), ("disk1", "restore-r1-disk1")]
        );
        assert_eq!(spec.data_volume_templates[0].name, "restore-r1-disk1");
    }

    #[test]
    fn test_no_backups_leaves_spec_untouched() {
        let content = content_with(Vec::new(), Vec::new());
        let restores = planned_restores(&content, "r1");
        assert!(restores.is_empty());
        let spec = &content.spec.source.virtual_machine.spec;
        assert_eq!(&rewire_volumes(spec, &restores), spec);
    }
}
