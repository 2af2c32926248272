//! Mock storage and compute provisioner.
//!
//! Stands in for the CSI driver, the snapshot controller, virt-handler and
//! the kubelet in development mode and tests. Each pass:
//!
//! 1. creates the claim behind every DataVolume template
//! 2. binds pending claims (`Immediate` at once, `WaitForFirstConsumer`
//!    once a VM that should run references them)
//! 3. marks volume snapshots durable, or failed when the storage class has
//!    no snapshot support
//! 4. reports VMs Running or Stopped
//! 5. marks DaemonSet pods ready

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use virtops_api::{
    Api, ClaimPhase, ObjectMeta, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod,
    PrintableStatus, Resource, ResourceRequirements, StorageClass, VirtualMachine,
    VolumeBindingMode, VolumeSnapshot, STORAGE_REQUEST,
};

use crate::context::Context;
use crate::error::ControllerResult;
use crate::worker::{ReconcileLoop, ReconcileStats};

pub struct MockProvisioner {
    ctx: Context,
    namespace: String,

    /// Whether every volume snapshot should fail.
    fail_snapshots: bool,
}

impl MockProvisioner {
    pub fn new(ctx: Context, namespace: impl Into<String>) -> Self {
        Self {
            ctx,
            namespace: namespace.into(),
            fail_snapshots: false,
        }
    }

    /// A provisioner whose volume snapshots all fail.
    pub fn failing(ctx: Context, namespace: impl Into<String>) -> Self {
        Self {
            fail_snapshots: true,
            ..Self::new(ctx, namespace)
        }
    }

    fn vms(&self) -> Api<VirtualMachine> {
        self.ctx.api(&self.namespace)
    }

    fn claims(&self) -> Api<PersistentVolumeClaim> {
        self.ctx.api(&self.namespace)
    }

    async fn storage_class(&self, name: Option<&str>) -> ControllerResult<Option<StorageClass>> {
        match name {
            Some(name) => Ok(self.ctx.cluster_api::<StorageClass>().get_opt(name).await?),
            None => Ok(None),
        }
    }

    /// Runs one provisioning pass; returns how many objects changed.
    pub async fn provision(&self) -> ControllerResult<usize> {
        let mut changed = self.create_data_volume_claims().await?;
        changed += self.bind_claims().await?;
        changed += self.complete_volume_snapshots().await?;
        changed += self.update_vm_status().await?;
        changed += self.ready_pods().await?;
        Ok(changed)
    }

    async fn create_data_volume_claims(&self) -> ControllerResult<usize> {
        let mut created = 0;
        for vm in self.vms().list().await? {
            // The restore engine owns the claims of a VM it is rewriting.
            if vm.status.restore_in_progress.is_some() {
                continue;
            }
            let Some(owner) = vm.controller_ref() else {
                continue;
            };
            for dv in &vm.spec.data_volume_templates {
                if self.claims().get_opt(&dv.name).await?.is_some() {
                    continue;
                }
                let mut resources = ResourceRequirements::default();
                if let Some(size) = &dv.size {
                    resources.requests.insert(STORAGE_REQUEST.to_string(), size.clone());
                }
                let claim = PersistentVolumeClaim {
                    metadata: ObjectMeta::named(&self.namespace, &dv.name).with_owner(owner.clone()),
                    spec: PersistentVolumeClaimSpec {
                        storage_class_name: dv.storage_class_name.clone(),
                        data_source: None,
                        resources,
                    },
                    status: Default::default(),
                };
                match self.claims().create(&claim).await {
                    Ok(_) => {
                        info!(vm = %vm.name(), claim = %dv.name, "[MOCK] Provisioned DataVolume claim");
                        created += 1;
                    }
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(created)
    }

    async fn bind_claims(&self) -> ControllerResult<usize> {
        let consumed: BTreeSet<String> = self
            .vms()
            .list()
            .await?
            .iter()
            .filter(|vm| vm.is_run_requested())
            .flat_map(|vm| {
                vm.spec
                    .persistent_claims()
                    .into_iter()
                    .map(|(_, claim)| claim.to_string())
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut bound = 0;
        for mut claim in self.claims().list().await? {
            if claim.is_bound() {
                continue;
            }
            let class = self
                .storage_class(claim.spec.storage_class_name.as_deref())
                .await?;
            let wait_for_consumer = class
                .is_some_and(|c| c.volume_binding_mode == VolumeBindingMode::WaitForFirstConsumer);
            if wait_for_consumer && !consumed.contains(claim.name()) {
                debug!(claim = %claim.name(), "[MOCK] Claim waiting for first consumer");
                continue;
            }
            claim.status.phase = ClaimPhase::Bound;
            self.claims().replace_status(&claim).await?;
            info!(claim = %claim.name(), "[MOCK] Bound claim");
            bound += 1;
        }
        Ok(bound)
    }

    async fn complete_volume_snapshots(&self) -> ControllerResult<usize> {
        let api: Api<VolumeSnapshot> = self.ctx.api(&self.namespace);
        let mut done = 0;
        for mut vs in api.list().await? {
            if vs.status.ready_to_use || vs.status.error.is_some() {
                continue;
            }
            let class = self
                .storage_class(vs.spec.storage_class_name.as_deref())
                .await?;
            let unsupported = class.as_ref().is_some_and(|c| !c.snapshot_supported);
            if self.fail_snapshots || unsupported {
                let message = format!(
                    "no snapshot class for storage class {:?}",
                    vs.spec.storage_class_name.as_deref().unwrap_or_default()
                );
                info!(volume_snapshot = %vs.name(), error = %message, "[MOCK] Volume snapshot failed");
                vs.status.error = Some(message);
            } else {
                info!(volume_snapshot = %vs.name(), claim = %vs.spec.persistent_volume_claim_name, "[MOCK] Volume snapshot ready");
                vs.status.ready_to_use = true;
                vs.status.creation_time = Some(Utc::now());
            }
            api.replace_status(&vs).await?;
            done += 1;
        }
        Ok(done)
    }

    async fn update_vm_status(&self) -> ControllerResult<usize> {
        let bound: BTreeSet<String> = self
            .claims()
            .list()
            .await?
            .into_iter()
            .filter(|c| c.is_bound())
            .map(|c| c.metadata.name)
            .collect();

        let mut updated = 0;
        for vm in self.vms().list().await? {
            let (printable, ready) = if !vm.is_run_requested() {
                (PrintableStatus::Stopped, false)
            } else if vm
                .spec
                .persistent_claims()
                .iter()
                .all(|(_, claim)| bound.contains(*claim))
            {
                (PrintableStatus::Running, true)
            } else {
                (PrintableStatus::Starting, false)
            };
            if vm.status.printable_status == printable && vm.status.ready == ready {
                continue;
            }
            let mut next = vm.clone();
            next.status.printable_status = printable;
            next.status.ready = ready;
            self.vms().replace_status(&next).await?;
            info!(vm = %vm.name(), from = %vm.status.printable_status, to = %printable, "[MOCK] VM status changed");
            updated += 1;
        }
        Ok(updated)
    }

    async fn ready_pods(&self) -> ControllerResult<usize> {
        let api: Api<Pod> = self.ctx.api(&self.namespace);
        let mut started = 0;
        for mut pod in api.list().await? {
            if pod.status.ready {
                continue;
            }
            pod.status.ready = true;
            pod.status.start_time = Some(Utc::now());
            api.replace_status(&pod).await?;
            debug!(pod = %pod.name(), node = %pod.spec.node_name, "[MOCK] Pod ready");
            started += 1;
        }
        Ok(started)
    }
}

#[async_trait]
impl ReconcileLoop for MockProvisioner {
    fn name(&self) -> &'static str {
        "provisioner"
    }

    async fn reconcile_all(&self) -> ControllerResult<ReconcileStats> {
        let changed = self.provision().await?;
        Ok(ReconcileStats {
            processed: changed,
            ..Default::default()
        })
    }
}
