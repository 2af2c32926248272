//! Clone controller.
//!
//! A clone is a snapshot followed by a restore into a new VM:
//!
//! ```text
//! "" ──> SnapshotInProgress ──> RestoreInProgress ──> Succeeded
//!  │              │                     │
//!  └──────────────┴─────────────────────┴──────────> Failed
//! ```
//!
//! Every pass reads the clone and the objects it created and moves at most
//! one step. The temporary snapshot and restore are owned by the clone and
//! deleted after success, once every restored claim is bound.

pub mod filter;
pub mod patches;

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use virtops_api::{
    Api, ClonePhase, Conditions, PersistentVolumeClaim, Resource, VirtualMachine,
    VirtualMachineClone, VirtualMachineCloneStatus, VirtualMachineRestore,
    VirtualMachineSnapshot, VirtualMachineSnapshotContent,
};
use virtops_events::reasons;
use virtops_reconcile::{Action, Backoff, RequeueSchedule, RetryTracker, DEFAULT_RETRY_WINDOW};

use crate::admission::{self, missing_backup, SNAPSHOT_KIND, VIRTUAL_MACHINE_KIND};
use crate::config::CloneConfig;
use crate::context::Context;
use crate::error::{ControllerError, ControllerResult};
use crate::worker::{lock, ReconcileLoop, ReconcileStats};

pub use patches::clone_patches;

/// Reconciles every clone in one namespace.
pub struct CloneReconciler {
    ctx: Context,
    namespace: String,
    config: CloneConfig,
    backoff: Mutex<Backoff>,
    retries: Mutex<RetryTracker>,
    schedule: Mutex<RequeueSchedule>,
}

impl CloneReconciler {
    pub fn new(ctx: Context, namespace: impl Into<String>, config: CloneConfig) -> Self {
        Self {
            backoff: Mutex::new(Backoff::new(
                config.source_backoff_base,
                config.source_backoff_max,
            )),
            retries: Mutex::new(RetryTracker::new(config.max_retries, DEFAULT_RETRY_WINDOW)),
            schedule: Mutex::new(RequeueSchedule::new()),
            ctx,
            namespace: namespace.into(),
            config,
        }
    }

    fn clones(&self) -> Api<VirtualMachineClone> {
        self.ctx.api(&self.namespace)
    }

    fn vms(&self) -> Api<VirtualMachine> {
        self.ctx.api(&self.namespace)
    }

    fn snapshots(&self) -> Api<VirtualMachineSnapshot> {
        self.ctx.api(&self.namespace)
    }

    fn restores(&self) -> Api<VirtualMachineRestore> {
        self.ctx.api(&self.namespace)
    }

    /// One step of the clone state machine.
    #[instrument(skip(self, clone), fields(clone = %clone.name(), phase = %clone.status.phase))]
    pub async fn reconcile(&self, clone: &VirtualMachineClone) -> ControllerResult<Action> {
        match clone.status.phase {
            ClonePhase::Unset => self.start(clone).await,
            ClonePhase::SnapshotInProgress => self.await_snapshot(clone).await,
            ClonePhase::RestoreInProgress => self.await_restore(clone).await,
            ClonePhase::Succeeded => self.cleanup(clone).await,
            ClonePhase::Failed => Ok(Action::AwaitChange),
        }
    }

    // =========================================================================
    // Phases
    // =========================================================================

    async fn start(&self, clone: &VirtualMachineClone) -> ControllerResult<Action> {
        let suffix = uid_suffix(clone)?;
        let source = &clone.spec.source;

        let found = match source.kind.as_str() {
            VIRTUAL_MACHINE_KIND => self.vms().get_opt(&source.name).await?.is_some(),
            SNAPSHOT_KIND => self.snapshots().get_opt(&source.name).await?.is_some(),
            other => {
                let message = format!("source kind {other:?} is not supported");
                return self.fail(clone, "InvalidSource", &message).await;
            }
        };
        if !found {
            return self.source_missing(clone).await;
        }
        lock(&self.backoff).reset(clone.name());

        let target = target_name(clone, &suffix);
        if self.vms().get_opt(&target).await?.is_some() {
            let message = format!("target VirtualMachine {target:?} already exists");
            self.ctx
                .recorder()
                .warning(&clone.object_ref(), reasons::TARGET_ALREADY_EXISTS, &message);
            return self.fail(clone, reasons::TARGET_ALREADY_EXISTS, &message).await;
        }

        let snapshot_name = if source.kind == VIRTUAL_MACHINE_KIND {
            let name = format!("tmp-snapshot-{suffix}");
            self.ensure_snapshot(clone, &name).await?;
            Some(name)
        } else {
            None
        };

        self.set_phase(clone, ClonePhase::SnapshotInProgress, |status| {
            status.snapshot_name = snapshot_name;
            status.target_name = Some(target);
            status.creation_time = Some(Utc::now());
            status.conditions = Some(Conditions::transition(
                status.conditions.as_ref(),
                true,
                false,
                "SnapshotInProgress",
            ));
        })
        .await?;
        Ok(Action::AwaitChange)
    }

    async fn await_snapshot(&self, clone: &VirtualMachineClone) -> ControllerResult<Action> {
        let snapshot_name = snapshot_in_use(clone);
        let Some(snapshot) = self.snapshots().get_opt(snapshot_name).await? else {
            let message = format!("snapshot {snapshot_name:?} was deleted before the restore was created");
            self.ctx
                .recorder()
                .warning(&clone.object_ref(), reasons::SNAPSHOT_DELETED, &message);
            return self.fail(clone, reasons::SNAPSHOT_DELETED, &message).await;
        };

        if snapshot.is_failed() {
            let cause = snapshot
                .status
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            let message = format!("snapshot {snapshot_name:?} failed: {cause}");
            return self.fail(clone, reasons::CLONE_FAILED, &message).await;
        }
        if !snapshot.is_ready_to_use() {
            debug!(snapshot = snapshot_name, "Waiting for snapshot");
            return Ok(Action::AwaitChange);
        }
        self.ctx.recorder().normal(
            &clone.object_ref(),
            reasons::SNAPSHOT_READY,
            &format!("snapshot {snapshot_name:?} is ready"),
        );

        let content = match snapshot.status.virtual_machine_snapshot_content_name.as_deref() {
            Some(name) => {
                self.ctx
                    .api::<VirtualMachineSnapshotContent>(&self.namespace)
                    .get_opt(name)
                    .await?
            }
            None => None,
        };
        let Some(content) = content else {
            let message = format!("snapshot {snapshot_name:?} has no content");
            return self.content_invalid(clone, &message).await;
        };
        if let Some(volume) = missing_backup(&content) {
            let message = format!("volume {volume:?} is not backed up in snapshot {snapshot_name:?}");
            return self.content_invalid(clone, &message).await;
        }

        let suffix = uid_suffix(clone)?;
        let target = clone
            .status
            .target_name
            .clone()
            .unwrap_or_else(|| target_name(clone, &suffix));
        let restore_name = format!("tmp-restore-{suffix}");
        let existing = self.restores().get_opt(&restore_name).await?;

        if existing.is_none() {
            if self.vms().get_opt(&target).await?.is_some() {
                let message = format!("target VirtualMachine {target:?} already exists");
                self.ctx
                    .recorder()
                    .warning(&clone.object_ref(), reasons::TARGET_ALREADY_EXISTS, &message);
                return self.fail(clone, reasons::TARGET_ALREADY_EXISTS, &message).await;
            }

            let patches = clone_patches(clone, &content.spec.source.virtual_machine)?;
            let mut restore =
                VirtualMachineRestore::new(&self.namespace, &restore_name, &target, snapshot_name)
                    .with_patches(patches);
            restore.metadata = restore.metadata.with_owner(owner_ref(clone)?);
            admission::create_restore(&self.ctx, &self.namespace, &restore).await?;
            self.ctx.recorder().normal(
                &clone.object_ref(),
                reasons::RESTORE_CREATED,
                &format!("created restore {restore_name:?} into VirtualMachine {target:?}"),
            );
        }

        self.set_phase(clone, ClonePhase::RestoreInProgress, |status| {
            status.restore_name = Some(restore_name);
            status.target_name = Some(target);
            status.conditions = Some(Conditions::transition(
                status.conditions.as_ref(),
                true,
                false,
                "RestoreInProgress",
            ));
        })
        .await?;
        Ok(Action::AwaitChange)
    }

    async fn await_restore(&self, clone: &VirtualMachineClone) -> ControllerResult<Action> {
        let restore_name = clone.status.restore_name.as_deref().ok_or_else(|| {
            ControllerError::invalid(
                VirtualMachineClone::KIND,
                clone.name(),
                "phase RestoreInProgress without a restore name",
            )
        })?;

        let Some(restore) = self.restores().get_opt(restore_name).await? else {
            let message = format!("restore {restore_name:?} was deleted");
            return self.fail(clone, reasons::RESTORE_FAILED, &message).await;
        };

        if restore.is_complete() {
            let recorder = self.ctx.recorder();
            let obj = clone.object_ref();
            recorder.normal(&obj, reasons::RESTORE_READY, &format!("restore {restore_name:?} is complete"));
            let target = &restore.spec.target.name;
            if self.vms().get_opt(target).await?.is_some() {
                recorder.normal(
                    &obj,
                    reasons::TARGET_VM_CREATED,
                    &format!("VirtualMachine {target:?} created"),
                );
            }
            self.set_phase(clone, ClonePhase::Succeeded, |status| {
                status.conditions = Some(Conditions::transition(
                    status.conditions.as_ref(),
                    false,
                    true,
                    "Succeeded",
                ));
            })
            .await?;
            recorder.normal(&obj, reasons::CLONE_SUCCEEDED, &format!("cloned into {target:?}"));
            return Ok(Action::AwaitChange);
        }

        if restore.is_failed() {
            let cause = restore
                .status
                .conditions
                .as_ref()
                .map(|c| c.ready().message.clone())
                .unwrap_or_default();
            let message = format!("restore {restore_name:?} failed: {cause}");
            return self.fail(clone, reasons::RESTORE_FAILED, &message).await;
        }

        if let Some(snapshot_name) = clone.status.snapshot_name.as_deref() {
            if self.snapshots().get_opt(snapshot_name).await?.is_none() {
                let message = format!("snapshot {snapshot_name:?} was deleted before the restore completed");
                self.ctx
                    .recorder()
                    .warning(&clone.object_ref(), reasons::SNAPSHOT_DELETED, &message);
                return self.fail(clone, reasons::SNAPSHOT_DELETED, &message).await;
            }
        }

        Ok(Action::AwaitChange)
    }

    /// Deletes the temporary snapshot and restore once every restored claim
    /// is bound. A clone whose target has since been deleted is removed.
    async fn cleanup(&self, clone: &VirtualMachineClone) -> ControllerResult<Action> {
        if let Some(target) = clone.status.target_name.as_deref() {
            if self.vms().get_opt(target).await?.is_none() {
                info!(target, "Target VirtualMachine deleted, removing clone");
                self.clones().delete_opt(clone.name()).await?;
                return Ok(Action::AwaitChange);
            }
        }

        let status = &clone.status;
        if status.snapshot_name.is_none() && status.restore_name.is_none() {
            return Ok(Action::AwaitChange);
        }

        if let Some(restore_name) = status.restore_name.as_deref() {
            if let Some(restore) = self.restores().get_opt(restore_name).await? {
                let claims: Api<PersistentVolumeClaim> = self.ctx.api(&self.namespace);
                let mut pending = Vec::new();
                for r in &restore.status.restores {
                    let bound = claims
                        .get_opt(&r.persistent_volume_claim)
                        .await?
                        .is_some_and(|c| c.is_bound());
                    if !bound {
                        pending.push(r.persistent_volume_claim.as_str());
                    }
                }
                if !pending.is_empty() {
                    debug!(?pending, "Deferring cleanup until claims are bound");
                    return Ok(Action::AwaitChange);
                }
                if !restore.status.restores.is_empty() {
                    self.ctx.recorder().normal(
                        &clone.object_ref(),
                        reasons::PVC_BOUND,
                        &format!("all claims of restore {restore_name:?} are bound"),
                    );
                }
                self.restores().delete_opt(restore_name).await?;
            }
        }

        if let Some(snapshot_name) = status.snapshot_name.as_deref() {
            self.snapshots().delete_opt(snapshot_name).await?;
        }

        let mut next = clone.clone();
        next.status.snapshot_name = None;
        next.status.restore_name = None;
        self.clones().replace_status(&next).await?;
        info!("Cleaned up temporary snapshot and restore");
        Ok(Action::AwaitChange)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn ensure_snapshot(&self, clone: &VirtualMachineClone, name: &str) -> ControllerResult<()> {
        if self.snapshots().get_opt(name).await?.is_some() {
            return Ok(());
        }
        let mut snapshot = VirtualMachineSnapshot::new(&self.namespace, name, &clone.spec.source.name);
        snapshot.metadata = snapshot.metadata.with_owner(owner_ref(clone)?);
        self.snapshots().create(&snapshot).await?;
        self.ctx.recorder().normal(
            &clone.object_ref(),
            reasons::SNAPSHOT_CREATED,
            &format!(
                "created snapshot {name:?} of VirtualMachine {:?}",
                clone.spec.source.name
            ),
        );
        Ok(())
    }

    async fn source_missing(&self, clone: &VirtualMachineClone) -> ControllerResult<Action> {
        let source = &clone.spec.source;
        let message = format!("source {} {:?} does not exist", source.kind, source.name);
        self.ctx
            .recorder()
            .normal(&clone.object_ref(), reasons::SOURCE_DOES_NOT_EXIST, &message);

        if let (Some(timeout), Some(created)) =
            (self.config.source_timeout, clone.metadata.creation_timestamp)
        {
            let waited = (Utc::now() - created).to_std().unwrap_or_default();
            if waited > timeout {
                let message = format!("{message} after waiting {waited:?}");
                return self.fail(clone, reasons::SOURCE_DOES_NOT_EXIST, &message).await;
            }
        }

        let delay = lock(&self.backoff).next_delay(clone.name());
        debug!(delay_ms = delay.as_millis() as u64, "Source missing, requeueing");
        Ok(Action::Requeue(delay))
    }

    async fn content_invalid(
        &self,
        clone: &VirtualMachineClone,
        message: &str,
    ) -> ControllerResult<Action> {
        self.ctx
            .recorder()
            .warning(&clone.object_ref(), reasons::SNAPSHOT_CONTENT_INVALID, message);
        self.fail(clone, reasons::SNAPSHOT_CONTENT_INVALID, message).await
    }

    async fn set_phase<F>(
        &self,
        clone: &VirtualMachineClone,
        phase: ClonePhase,
        update: F,
    ) -> ControllerResult<VirtualMachineClone>
    where
        F: FnOnce(&mut VirtualMachineCloneStatus),
    {
        let mut next = clone.clone();
        next.status.phase = phase;
        update(&mut next.status);
        let updated = self.clones().replace_status(&next).await?;
        info!(from = %clone.status.phase, to = %phase, "Clone phase transition");
        Ok(updated)
    }

    async fn fail(
        &self,
        clone: &VirtualMachineClone,
        reason: &str,
        message: &str,
    ) -> ControllerResult<Action> {
        self.set_phase(clone, ClonePhase::Failed, |status| {
            status.conditions = Some(
                Conditions::transition(status.conditions.as_ref(), false, false, reason)
                    .with_message(message),
            );
        })
        .await?;
        self.ctx
            .recorder()
            .warning(&clone.object_ref(), reasons::CLONE_FAILED, message);
        Ok(Action::AwaitChange)
    }
}

#[async_trait]
impl ReconcileLoop for CloneReconciler {
    fn name(&self) -> &'static str {
        "clone"
    }

    async fn reconcile_all(&self) -> ControllerResult<ReconcileStats> {
        let clones = self.clones().list().await?;
        let mut stats = ReconcileStats::default();
        let now = Instant::now();
        lock(&self.schedule).retain_keys(clones.iter().map(|c| c.name()));

        for clone in &clones {
            let key = clone.name();
            if !lock(&self.schedule).is_due(key, now) {
                stats.deferred += 1;
                continue;
            }

            match self.reconcile(clone).await {
                Ok(action) => {
                    lock(&self.retries).clear(key);
                    lock(&self.schedule).schedule(key, action, Instant::now());
                    stats.processed += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(clone = %key, error = %e, "Failed to reconcile clone");
                    if e.is_transient() {
                        continue;
                    }
                    let exhausted = lock(&self.retries).record_failure(key);
                    if exhausted {
                        let message = format!("giving up after repeated errors: {e}");
                        if let Err(e) = self.fail(clone, reasons::CLONE_FAILED, &message).await {
                            warn!(clone = %key, error = %e, "Failed to mark clone failed");
                        }
                    }
                }
            }
        }

        lock(&self.retries).prune();
        Ok(stats)
    }
}

fn uid_suffix(clone: &VirtualMachineClone) -> ControllerResult<String> {
    clone.metadata.uid.map(|uid| uid.short()).ok_or_else(|| {
        ControllerError::invalid(VirtualMachineClone::KIND, clone.name(), "object has no uid")
    })
}

fn owner_ref(clone: &VirtualMachineClone) -> ControllerResult<virtops_api::OwnerReference> {
    clone.controller_ref().ok_or_else(|| {
        ControllerError::invalid(VirtualMachineClone::KIND, clone.name(), "object has no uid")
    })
}

/// Requested target name, else the one recorded at start, else a name
/// derived from the clone uid.
fn target_name(clone: &VirtualMachineClone, suffix: &str) -> String {
    clone
        .spec
        .target
        .as_ref()
        .map(|t| t.name.clone())
        .filter(|n| !n.is_empty())
        .or_else(|| clone.status.target_name.clone())
        .unwrap_or_else(|| format!("vm-clone-{suffix}"))
}

/// The snapshot a clone restores from: its own temporary snapshot, or the
/// snapshot it was pointed at.
fn snapshot_in_use(clone: &VirtualMachineClone) -> &str {
    clone
        .status
        .snapshot_name
        .as_deref()
        .unwrap_or(&clone.spec.source.name)
}
