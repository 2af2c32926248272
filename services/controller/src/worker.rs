//! Periodic reconcile worker.
//!
//! Every controller runs as a [`Worker`] wrapping a [`ReconcileLoop`]: one
//! full pass per tick until shutdown is signaled.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::ControllerResult;

/// Counters for one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Objects reconciled without error.
    pub processed: usize,
    /// Objects whose reconcile returned an error.
    pub failed: usize,
    /// Objects skipped because their requeue time has not come yet.
    pub deferred: usize,
}

impl ReconcileStats {
    pub fn is_idle(&self) -> bool {
        self.processed == 0 && self.failed == 0
    }
}

impl std::ops::AddAssign for ReconcileStats {
    fn add_assign(&mut self, rhs: Self) {
        self.processed += rhs.processed;
        self.failed += rhs.failed;
        self.deferred += rhs.deferred;
    }
}

/// One controller's full reconcile pass.
#[async_trait]
pub trait ReconcileLoop: Send + Sync {
    fn name(&self) -> &'static str;

    /// Visits every object the controller owns. Per-object failures are
    /// counted, not returned.
    async fn reconcile_all(&self) -> ControllerResult<ReconcileStats>;
}

/// Runs a [`ReconcileLoop`] on a fixed interval.
pub struct Worker<R> {
    reconciler: R,
    interval: Duration,
}

impl<R: ReconcileLoop> Worker<R> {
    pub fn new(reconciler: R, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }

    pub fn reconciler(&self) -> &R {
        &self.reconciler
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(worker = self.reconciler.name()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting {} worker",
            self.reconciler.name()
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("{} worker shutting down", self.reconciler.name());
                        break;
                    }
                }
            }
        }
    }

    /// A single pass; errors are logged.
    pub async fn run_once(&self) -> Option<ReconcileStats> {
        match self.reconciler.reconcile_all().await {
            Ok(stats) => {
                if !stats.is_idle() {
                    debug!(
                        processed = stats.processed,
                        failed = stats.failed,
                        deferred = stats.deferred,
                        "{} pass complete",
                        self.reconciler.name()
                    );
                }
                Some(stats)
            }
            Err(e) => {
                error!(error = %e, "{} pass failed", self.reconciler.name());
                None
            }
        }
    }
}

/// Locks a bookkeeping mutex. The guarded maps stay valid if a holder
/// panicked, so poisoning is ignored.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
