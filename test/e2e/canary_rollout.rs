//! End-to-end canary rollout.
//!
//! Runs the rollout coordinator and the mock provisioner as real workers
//! against one store and follows the component DaemonSet through the store's
//! change feed, verifying:
//!
//! 1. The install template is recorded and every node gets a ready pod
//! 2. A KubeVirt customization starts a rollout
//! 3. `maxUnavailable` moves through 1, 10%, 1
//! 4. Every pod ends on the new template and the stage annotations are gone
//!
//! ## Running
//!
//! ```bash
//! cargo test -p virtops-e2e --test canary_rollout
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use virtops_api::{
    Api, CustomizeComponents, CustomizeComponentsPatch, DaemonSet, DaemonSetSpec, KubeVirt,
    KubeVirtSpec, Node, ObjectMeta, ObjectStore, PatchType, Pod, Resource, SqliteStore,
};
use virtops_controller::rollout::{DAEMONSET_RESOURCE_TYPE, STAGE_ANNOTATION};
use virtops_controller::{
    Context, MockProvisioner, ReconcileLoop, RolloutConfig, RolloutReconciler, Worker,
};
use virtops_events::{reasons, MemoryRecorder};

const NS: &str = "kubevirt";
const NODES: usize = 4;
const TICK: Duration = Duration::from_millis(10);
const DEADLINE: Duration = Duration::from_secs(20);

fn spawn<R: ReconcileLoop + 'static>(reconciler: R, shutdown: &watch::Receiver<bool>) -> JoinHandle<()> {
    let worker = Worker::new(reconciler, TICK);
    let shutdown = shutdown.clone();
    tokio::spawn(async move { worker.run(shutdown).await })
}

/// Forwards every committed DaemonSet write, decoded.
fn follow_daemonsets(store: &Arc<dyn ObjectStore>) -> mpsc::UnboundedReceiver<DaemonSet> {
    let mut feed = store.watch();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(event) if event.kind == DaemonSet::KIND => {
                    if let Ok(ds) = serde_json::from_value::<DaemonSet>(event.object) {
                        if tx.send(ds).is_err() {
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    panic!("change feed dropped {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
    rx
}

async fn wait_for_ready_pods(pods: &Api<Pod>, count: usize) {
    let start = std::time::Instant::now();
    loop {
        let ready = pods
            .list()
            .await
            .unwrap()
            .iter()
            .filter(|p| p.is_ready())
            .count();
        if ready == count {
            return;
        }
        if start.elapsed() > DEADLINE {
            panic!("only {ready} of {count} pods became ready within {DEADLINE:?}");
        }
        tokio::time::sleep(TICK).await;
    }
}

fn handler_daemonset() -> DaemonSet {
    DaemonSet {
        metadata: ObjectMeta::named(NS, "virt-handler"),
        spec: DaemonSetSpec {
            template: json!({
                "metadata": { "labels": { "kubevirt.io": "virt-handler" } },
                "spec": { "containers": [ { "name": "virt-handler", "image": "virt-handler:v1" } ] }
            }),
            ..Default::default()
        },
        status: Default::default(),
    }
}

fn image_override() -> CustomizeComponents {
    CustomizeComponents {
        patches: vec![CustomizeComponentsPatch {
            resource_name: "virt-handler".to_string(),
            resource_type: DAEMONSET_RESOURCE_TYPE.to_string(),
            patch: r#"[{"op":"replace","path":"/spec/template/spec/containers/0/image","value":"virt-handler:v2"}]"#
                .to_string(),
            patch_type: PatchType::Json,
        }],
    }
}

#[tokio::test]
async fn test_canary_rollout_widens_then_narrows() {
    let store: Arc<dyn ObjectStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let recorder = Arc::new(MemoryRecorder::new());
    let ctx = Context::new(store.clone(), recorder.clone());

    for i in 0..NODES {
        ctx.cluster_api::<Node>()
            .create(&Node::new(format!("node-{i}")))
            .await
            .unwrap();
    }
    let daemonsets: Api<DaemonSet> = ctx.api(NS);
    daemonsets.create(&handler_daemonset()).await.unwrap();
    let kubevirts: Api<KubeVirt> = ctx.api(NS);
    let mut kv = kubevirts
        .create(&KubeVirt {
            metadata: ObjectMeta::named(NS, "kubevirt"),
            spec: KubeVirtSpec::default(),
        })
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = vec![
        spawn(
            RolloutReconciler::new(ctx.clone(), NS, RolloutConfig::default()),
            &shutdown_rx,
        ),
        spawn(MockProvisioner::new(ctx.clone(), NS), &shutdown_rx),
    ];

    let pods: Api<Pod> = ctx.api(NS);
    wait_for_ready_pods(&pods, NODES).await;

    let mut writes = follow_daemonsets(&store);
    kv.spec.customize_components = image_override();
    kubevirts.replace(&kv).await.unwrap();

    let mut sequence: Vec<String> = Vec::new();
    let mut stages_seen = false;
    let observed = tokio::time::timeout(DEADLINE, async {
        while let Some(ds) = writes.recv().await {
            let max = ds.max_unavailable().to_string();
            if sequence.last() != Some(&max) {
                sequence.push(max);
            }
            match ds.metadata.annotations.get(STAGE_ANNOTATION) {
                Some(_) => stages_seen = true,
                None if stages_seen => return,
                None => {}
            }
        }
    })
    .await;
    assert!(observed.is_ok(), "rollout did not finish, saw {sequence:?}");
    assert_eq!(sequence, vec!["1", "10%", "1"]);

    wait_for_ready_pods(&pods, NODES).await;
    let ds = daemonsets.get("virt-handler").await.unwrap();
    assert_eq!(ds.spec.template["spec"]["containers"][0]["image"], "virt-handler:v2");
    assert_eq!(ds.status.desired_number_scheduled, NODES as i32);

    let current = pods.list().await.unwrap();
    assert_eq!(current.len(), NODES);
    let hashes: std::collections::BTreeSet<_> =
        current.iter().map(|p| p.revision_hash().map(str::to_string)).collect();
    assert_eq!(hashes.len(), 1, "pods on mixed revisions: {hashes:?}");

    let obj = ds.object_ref();
    for reason in [
        reasons::ROLLOUT_STARTED,
        reasons::ROLLOUT_WIDENED,
        reasons::ROLLOUT_NARROWED,
        reasons::ROLLOUT_COMPLETE,
    ] {
        assert!(recorder.has_reason(&obj, reason), "missing event {reason}");
    }
    assert!(!recorder.has_reason(&obj, reasons::ROLLOUT_STUCK));

    let _ = shutdown_tx.send(true);
    for handle in handles {
        handle.await.unwrap();
    }
}
