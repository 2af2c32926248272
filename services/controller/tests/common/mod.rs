//! Shared fixture: every reconciler over one in-memory store, stepped by
//! hand so each test controls how many passes run.

#![allow(dead_code)]

use std::sync::Arc;

use virtops_api::{
    Api, ClaimPhase, ClaimSource, DataVolumeSource, DataVolumeTemplate, Firmware, Interface,
    PersistentVolumeClaim, SqliteStore, StorageClass, VirtualMachine, VirtualMachineSpec, Volume,
    VolumeBindingMode, VolumeSource, STORAGE_REQUEST,
};
use virtops_controller::{
    CloneConfig, CloneReconciler, Context, GarbageCollector, MockProvisioner, ReconcileLoop,
    RestoreReconciler, SnapshotReconciler, StoreVolumeSnapshotter,
};
use virtops_events::MemoryRecorder;

pub const NS: &str = "default";

pub struct Harness {
    pub ctx: Context,
    pub recorder: Arc<MemoryRecorder>,
    pub provisioner: MockProvisioner,
    pub snapshots: SnapshotReconciler,
    pub restores: RestoreReconciler,
    pub clones: CloneReconciler,
    pub gc: GarbageCollector,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_clone_config(CloneConfig::default())
    }

    pub fn with_clone_config(config: CloneConfig) -> Self {
        let recorder = Arc::new(MemoryRecorder::new());
        let ctx = Context::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            recorder.clone(),
        );
        Self {
            provisioner: MockProvisioner::new(ctx.clone(), NS),
            snapshots: SnapshotReconciler::new(
                ctx.clone(),
                NS,
                Arc::new(StoreVolumeSnapshotter::new(ctx.clone())),
            ),
            restores: RestoreReconciler::new(ctx.clone(), NS),
            clones: CloneReconciler::new(ctx.clone(), NS, config),
            gc: GarbageCollector::new(ctx.clone()),
            ctx,
            recorder,
        }
    }

    /// One pass of every reconciler, provisioner first.
    pub async fn step(&self) {
        self.provisioner.reconcile_all().await.unwrap();
        self.snapshots.reconcile_all().await.unwrap();
        self.restores.reconcile_all().await.unwrap();
        self.clones.reconcile_all().await.unwrap();
        self.gc.reconcile_all().await.unwrap();
    }

    pub async fn steps(&self, n: usize) {
        for _ in 0..n {
            self.step().await;
        }
    }

    pub fn api<K: virtops_api::Resource>(&self) -> Api<K> {
        self.ctx.api(NS)
    }

    pub async fn storage_class(&self, name: &str, mode: VolumeBindingMode) {
        self.ctx
            .cluster_api::<StorageClass>()
            .create(&StorageClass::new(name, mode, true))
            .await
            .unwrap();
    }

    /// A claim of `class`, bound or pending.
    pub async fn claim(&self, name: &str, class: &str, bound: bool) {
        let mut claim = PersistentVolumeClaim::new(NS, name, Some(class.to_string()));
        claim
            .spec
            .resources
            .requests
            .insert(STORAGE_REQUEST.to_string(), "1Gi".to_string());
        let api: Api<PersistentVolumeClaim> = self.api();
        let mut created = api.create(&claim).await.unwrap();
        if bound {
            created.status.phase = ClaimPhase::Bound;
            api.replace_status(&created).await.unwrap();
        }
    }

    pub async fn create_vm(&self, vm: &VirtualMachine) -> VirtualMachine {
        self.api::<VirtualMachine>().create(vm).await.unwrap()
    }
}

/// A stopped VM with one claim-backed disk and a full identity.
pub fn vm_with_disk(name: &str, claim: &str) -> VirtualMachine {
    let mut spec = VirtualMachineSpec {
        running: Some(false),
        ..Default::default()
    };
    spec.template.spec.domain.firmware = Some(Firmware {
        uuid: Some("8a9f0e62-4b4f-4d8e-9d6a-0d3f2c1b5a77".to_string()),
        serial: Some("serial-orig".to_string()),
    });
    spec.template.spec.domain.devices.interfaces.push(Interface {
        name: "default".to_string(),
        mac_address: Some("02:00:00:aa:bb:cc".to_string()),
        binding: Some("masquerade".to_string()),
    });
    spec.template.spec.volumes.push(Volume {
        name: "disk0".to_string(),
        source: VolumeSource::PersistentVolumeClaim(ClaimSource {
            claim_name: claim.to_string(),
        }),
    });
    spec.template
        .metadata
        .labels
        .insert("kubevirt.io/domain".to_string(), name.to_string());

    let mut vm = VirtualMachine::new(NS, name, spec);
    vm.metadata.labels.insert("app".to_string(), "web".to_string());
    vm.metadata
        .labels
        .insert("kubevirt.io/created-by".to_string(), "operator".to_string());
    vm
}

/// A stopped VM whose only disk is a DataVolume it owns.
pub fn vm_with_data_volume(name: &str, class: &str) -> VirtualMachine {
    let dv = format!("{name}-root");
    let mut spec = VirtualMachineSpec {
        running: Some(false),
        ..Default::default()
    };
    spec.data_volume_templates.push(DataVolumeTemplate {
        name: dv.clone(),
        storage_class_name: Some(class.to_string()),
        size: Some("2Gi".to_string()),
    });
    spec.template.spec.volumes.push(Volume {
        name: "root".to_string(),
        source: VolumeSource::DataVolume(DataVolumeSource { name: dv }),
    });
    VirtualMachine::new(NS, name, spec)
}
