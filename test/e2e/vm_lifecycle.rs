//! End-to-end VM lifecycle.
//!
//! Runs every controller as a worker, plus the mock provisioner, against one
//! store and drives them only through admission and the run-state
//! operations, the way a user would:
//!
//! 1. Clone a VM onto WaitForFirstConsumer storage; cleanup waits for the
//!    target to start
//! 2. Snapshot a VM with a DataVolume and restore it in place
//!
//! ## Running
//!
//! ```bash
//! cargo test -p virtops-e2e --test vm_lifecycle
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use virtops_api::{
    Api, ClaimSource, ClonePhase, DataVolumeSource, DataVolumeTemplate, Firmware, Interface,
    PersistentVolumeClaim, PrintableStatus, Resource, SqliteStore, StorageClass,
    TypedLocalObjectReference, VirtualMachine, VirtualMachineClone, VirtualMachineRestore,
    VirtualMachineSnapshot, VirtualMachineSpec, Volume, VolumeBindingMode, VolumeSource,
    STORAGE_REQUEST,
};
use virtops_controller::{
    admission, operations, CloneConfig, CloneReconciler, Context, GarbageCollector,
    MockProvisioner, ReconcileLoop, RestoreReconciler, SnapshotReconciler,
    StoreVolumeSnapshotter, Worker,
};
use virtops_events::{reasons, MemoryRecorder};

const NS: &str = "default";
const TICK: Duration = Duration::from_millis(10);
const DEADLINE: Duration = Duration::from_secs(20);

struct Cluster {
    ctx: Context,
    recorder: Arc<MemoryRecorder>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Cluster {
    fn start() -> Self {
        let recorder = Arc::new(MemoryRecorder::new());
        let ctx = Context::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            recorder.clone(),
        );
        let (shutdown, rx) = watch::channel(false);
        let handles = vec![
            spawn(MockProvisioner::new(ctx.clone(), NS), &rx),
            spawn(
                SnapshotReconciler::new(
                    ctx.clone(),
                    NS,
                    Arc::new(StoreVolumeSnapshotter::new(ctx.clone())),
                ),
                &rx,
            ),
            spawn(RestoreReconciler::new(ctx.clone(), NS), &rx),
            spawn(CloneReconciler::new(ctx.clone(), NS, CloneConfig::default()), &rx),
            spawn(GarbageCollector::new(ctx.clone()), &rx),
        ];
        Self {
            ctx,
            recorder,
            shutdown,
            handles,
        }
    }

    fn api<K: Resource>(&self) -> Api<K> {
        self.ctx.api(NS)
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            handle.await.unwrap();
        }
    }
}

fn spawn<R: ReconcileLoop + 'static>(reconciler: R, shutdown: &watch::Receiver<bool>) -> JoinHandle<()> {
    let worker = Worker::new(reconciler, TICK);
    let shutdown = shutdown.clone();
    tokio::spawn(async move { worker.run(shutdown).await })
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while !check().await {
        if start.elapsed() > DEADLINE {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(TICK).await;
    }
}

async fn storage_class(cluster: &Cluster, name: &str, mode: VolumeBindingMode) {
    cluster
        .ctx
        .cluster_api::<StorageClass>()
        .create(&StorageClass::new(name, mode, true))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_clone_cleanup_waits_for_target_start() {
    let cluster = Cluster::start();
    storage_class(&cluster, "local", VolumeBindingMode::WaitForFirstConsumer).await;

    let mut claim = PersistentVolumeClaim::new(NS, "db-disk", Some("local".to_string()));
    claim
        .spec
        .resources
        .requests
        .insert(STORAGE_REQUEST.to_string(), "10Gi".to_string());
    cluster.api::<PersistentVolumeClaim>().create(&claim).await.unwrap();

    let mut spec = VirtualMachineSpec {
        running: Some(false),
        ..Default::default()
    };
    spec.template.spec.domain.firmware = Some(Firmware {
        uuid: Some("0d6b7c3e-2f1a-4c55-8a0e-3b9d2e7f6a10".to_string()),
        serial: None,
    });
    spec.template.spec.domain.devices.interfaces.push(Interface {
        name: "default".to_string(),
        mac_address: Some("02:00:00:10:20:30".to_string()),
        binding: Some("bridge".to_string()),
    });
    spec.template.spec.volumes.push(Volume {
        name: "data".to_string(),
        source: VolumeSource::PersistentVolumeClaim(ClaimSource {
            claim_name: "db-disk".to_string(),
        }),
    });
    let mut source = VirtualMachine::new(NS, "db", spec);
    source.metadata.labels = BTreeMap::from([
        ("app".to_string(), "db".to_string()),
        ("team".to_string(), "storage".to_string()),
    ]);
    cluster.api::<VirtualMachine>().create(&source).await.unwrap();

    let mut request = VirtualMachineClone::new(
        NS,
        "db-clone",
        TypedLocalObjectReference::new(VirtualMachine::KIND, "db"),
        "db-copy",
    );
    request.spec.label_filters = vec!["app".to_string()];
    request.spec.new_smbios_serial = Some("copy-0001".to_string());
    admission::create_clone(&cluster.ctx, NS, &request).await.unwrap();

    let clones: Api<VirtualMachineClone> = cluster.api();
    wait_until("clone to succeed", || async {
        clones.get("db-clone").await.unwrap().status.phase == ClonePhase::Succeeded
    })
    .await;

    // Nothing consumes the restored claim yet.
    tokio::time::sleep(TICK * 10).await;
    let clone = clones.get("db-clone").await.unwrap();
    assert!(clone.status.restore_name.is_some());
    assert!(!cluster.recorder.has_reason(&clone.object_ref(), reasons::PVC_BOUND));

    let target = cluster.api::<VirtualMachine>().get("db-copy").await.unwrap();
    assert_eq!(
        target.metadata.labels,
        BTreeMap::from([("app".to_string(), "db".to_string())])
    );
    let firmware = target.spec.template.spec.domain.firmware.clone().unwrap_or_default();
    assert_eq!(firmware.serial.as_deref(), Some("copy-0001"));
    assert!(firmware.uuid.is_some());
    assert_ne!(
        firmware.uuid.as_deref(),
        Some("0d6b7c3e-2f1a-4c55-8a0e-3b9d2e7f6a10")
    );
    assert!(target.spec.template.spec.domain.devices.interfaces[0]
        .mac_address
        .is_none());

    operations::start_vm(&cluster.ctx, NS, "db-copy").await.unwrap();
    wait_until("clone cleanup", || async {
        let clone = clones.get("db-clone").await.unwrap();
        clone.status.restore_name.is_none() && clone.status.snapshot_name.is_none()
    })
    .await;
    assert!(cluster.recorder.has_reason(&clone.object_ref(), reasons::PVC_BOUND));

    let vms: Api<VirtualMachine> = cluster.api();
    wait_until("target to run", || async {
        vms.get("db-copy").await.unwrap().status.printable_status == PrintableStatus::Running
    })
    .await;
    wait_until("temporaries to be collected", || async {
        cluster
            .api::<VirtualMachineSnapshot>()
            .list()
            .await
            .unwrap()
            .is_empty()
    })
    .await;

    cluster.stop().await;
}

#[tokio::test]
async fn test_restore_in_place_swaps_data_volume() {
    let cluster = Cluster::start();
    storage_class(&cluster, "ssd", VolumeBindingMode::Immediate).await;

    let mut spec = VirtualMachineSpec {
        running: Some(false),
        ..Default::default()
    };
    spec.data_volume_templates.push(DataVolumeTemplate {
        name: "web-root".to_string(),
        storage_class_name: Some("ssd".to_string()),
        size: Some("5Gi".to_string()),
    });
    spec.template.spec.volumes.push(Volume {
        name: "root".to_string(),
        source: VolumeSource::DataVolume(DataVolumeSource {
            name: "web-root".to_string(),
        }),
    });
    cluster
        .api::<VirtualMachine>()
        .create(&VirtualMachine::new(NS, "web", spec))
        .await
        .unwrap();

    let claims: Api<PersistentVolumeClaim> = cluster.api();
    wait_until("DataVolume claim to bind", || async {
        claims
            .get_opt("web-root")
            .await
            .unwrap()
            .is_some_and(|c| c.is_bound())
    })
    .await;

    let snapshots: Api<VirtualMachineSnapshot> = cluster.api();
    snapshots
        .create(&VirtualMachineSnapshot::new(NS, "web-snap", "web"))
        .await
        .unwrap();
    wait_until("snapshot to be ready", || async {
        snapshots.get("web-snap").await.unwrap().is_ready_to_use()
    })
    .await;

    let restores: Api<VirtualMachineRestore> = cluster.api();
    admission::create_restore(
        &cluster.ctx,
        NS,
        &VirtualMachineRestore::new(NS, "web-restore", "web", "web-snap"),
    )
    .await
    .unwrap();
    wait_until("restore to complete", || async {
        restores.get("web-restore").await.unwrap().is_complete()
    })
    .await;

    let restore = restores.get("web-restore").await.unwrap();
    assert_eq!(restore.status.deleted_data_volumes, vec!["web-root".to_string()]);
    let restored = restore.status.restores[0].persistent_volume_claim.clone();
    assert!(claims.get_opt("web-root").await.unwrap().is_none());

    operations::start_vm(&cluster.ctx, NS, "web").await.unwrap();
    let vms: Api<VirtualMachine> = cluster.api();
    wait_until("restored VM to run", || async {
        let vm = vms.get("web").await.unwrap();
        vm.status.printable_status == PrintableStatus::Running && vm.status.ready
    })
    .await;
    assert!(claims.get(&restored).await.unwrap().is_bound());
    // The provisioner must not have recreated the old DataVolume.
    assert!(claims.get_opt("web-root").await.unwrap().is_none());

    cluster.stop().await;
}
