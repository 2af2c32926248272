//! virtops controller
//!
//! Runs the snapshot, restore, clone, rollout and garbage collection
//! workers against one object store until interrupted. With `VIRTOPS_DEV`
//! set, a mock provisioner binds claims, completes volume snapshots and
//! starts VMs and pods so the controllers can be exercised without a
//! cluster.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use virtops_controller::{
    CloneReconciler, Config, Context, GarbageCollector, MockProvisioner, ReconcileLoop,
    RestoreReconciler, RolloutReconciler, SnapshotReconciler, StoreVolumeSnapshotter, Worker,
};
use virtops_events::MemoryRecorder;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting virtops controller");
    info!(
        namespace = %config.namespace,
        data_path = ?config.data_path,
        reconcile_interval_ms = config.reconcile_interval.as_millis() as u64,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    let store = config.open_store()?;
    let ctx = Context::new(store, Arc::new(MemoryRecorder::new()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ns = config.namespace.clone();
    let every = config.reconcile_interval;

    let mut handles = vec![
        spawn(
            SnapshotReconciler::new(
                ctx.clone(),
                ns.clone(),
                Arc::new(StoreVolumeSnapshotter::new(ctx.clone())),
            ),
            every,
            &shutdown_rx,
        ),
        spawn(RestoreReconciler::new(ctx.clone(), ns.clone()), every, &shutdown_rx),
        spawn(
            CloneReconciler::new(ctx.clone(), ns.clone(), config.clone.clone()),
            every,
            &shutdown_rx,
        ),
        spawn(
            RolloutReconciler::new(ctx.clone(), ns.clone(), config.rollout.clone()),
            every,
            &shutdown_rx,
        ),
        spawn(GarbageCollector::new(ctx.clone()), config.gc_interval, &shutdown_rx),
    ];
    if config.dev_mode {
        info!("Development mode, starting mock provisioner");
        handles.push(spawn(MockProvisioner::new(ctx.clone(), ns), every, &shutdown_rx));
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let join_all = async {
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all).await.is_err() {
        warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Workers did not stop in time"
        );
    }

    info!("Controller shutdown complete");
    Ok(())
}

fn spawn<R>(reconciler: R, interval: Duration, shutdown: &watch::Receiver<bool>) -> JoinHandle<()>
where
    R: ReconcileLoop + 'static,
{
    let worker = Worker::new(reconciler, interval);
    let shutdown = shutdown.clone();
    tokio::spawn(async move { worker.run(shutdown).await })
}
