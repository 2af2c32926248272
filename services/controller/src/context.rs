//! Shared handles passed to every reconciler.

use std::sync::Arc;

use virtops_api::{Api, ObjectStore, Resource};
use virtops_events::EventRecorder;

/// Store and event sink shared by the reconcilers.
#[derive(Clone)]
pub struct Context {
    store: Arc<dyn ObjectStore>,
    recorder: Arc<dyn EventRecorder>,
}

impl Context {
    pub fn new(store: Arc<dyn ObjectStore>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self { store, recorder }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn recorder(&self) -> &dyn EventRecorder {
        self.recorder.as_ref()
    }

    /// Typed handle for a namespaced kind.
    pub fn api<K: Resource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(Arc::clone(&self.store), namespace)
    }

    /// Typed handle for a cluster-scoped kind.
    pub fn cluster_api<K: Resource>(&self) -> Api<K> {
        Api::cluster(Arc::clone(&self.store))
    }
}
