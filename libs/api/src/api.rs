//! Typed handle over an [`ObjectStore`].

use std::marker::PhantomData;
use std::sync::Arc;

use json_patch::Patch;
use serde_json::Value;

use crate::{ObjectKey, ObjectStore, Resource, StoreError};

/// Typed access to one kind within one namespace (empty for
/// cluster-scoped kinds). Never retries; conflicts surface to the caller.
pub struct Api<K> {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: self.namespace.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: Resource> Api<K> {
    pub fn namespaced(store: Arc<dyn ObjectStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            _kind: PhantomData,
        }
    }

    pub fn cluster(store: Arc<dyn ObjectStore>) -> Self {
        Self::namespaced(store, "")
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn key(&self, name: &str) -> ObjectKey {
        ObjectKey::new(K::KIND, self.namespace.clone(), name)
    }

    pub async fn get(&self, name: &str) -> Result<K, StoreError> {
        self.get_opt(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(self.key(name)))
    }

    pub async fn get_opt(&self, name: &str) -> Result<Option<K>, StoreError> {
        self.store
            .get(&self.key(name))
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn list(&self) -> Result<Vec<K>, StoreError> {
        self.store
            .list(K::KIND, Some(&self.namespace))
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Creates `obj` in this handle's namespace.
    pub async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let mut obj = obj.clone();
        obj.meta_mut().namespace = self.namespace.clone();
        decode(self.store.create(K::KIND, encode(&obj)?).await?)
    }

    pub async fn replace(&self, obj: &K) -> Result<K, StoreError> {
        self.check_namespace(obj)?;
        decode(self.store.replace(K::KIND, encode(obj)?).await?)
    }

    pub async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        self.check_namespace(obj)?;
        decode(self.store.replace_status(K::KIND, encode(obj)?).await?)
    }

    pub async fn patch(&self, name: &str, patch: &Patch) -> Result<K, StoreError> {
        decode(self.store.patch(&self.key(name), patch).await?)
    }

    pub async fn delete(&self, name: &str) -> Result<K, StoreError> {
        decode(self.store.delete(&self.key(name)).await?)
    }

    /// Deletes if present; returns whether anything was deleted.
    pub async fn delete_opt(&self, name: &str) -> Result<bool, StoreError> {
        match self.store.delete(&self.key(name)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn check_namespace(&self, obj: &K) -> Result<(), StoreError> {
        if obj.namespace() != self.namespace {
            return Err(StoreError::Invalid(format!(
                "{} {:?} is in namespace {:?}, handle is for {:?}",
                K::KIND,
                obj.name(),
                obj.namespace(),
                self.namespace
            )));
        }
        Ok(())
    }
}

fn encode<K: Resource>(obj: &K) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(obj)?)
}

fn decode<K: Resource>(value: Value) -> Result<K, StoreError> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ObjectMeta, SqliteStore, VirtualMachine, VirtualMachineSpec, PatchBuilder, StorageClass,
        VolumeBindingMode,
    };
    use serde_json::json;

    fn store() -> Arc<dyn ObjectStore> {
        Arc::new(SqliteStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let vms: Api<VirtualMachine> = Api::namespaced(store(), "default");
        let mut vm = VirtualMachine::new("", "vm-a", VirtualMachineSpec::default());
        vm.spec.running = Some(false);

        let created = vms.create(&vm).await.unwrap();
        assert_eq!(created.namespace(), "default");
        assert!(created.metadata.uid.is_some());

        let fetched = vms.get("vm-a").await.unwrap();
        assert_eq!(fetched, created);
        assert!(vms.get_opt("missing").await.unwrap().is_none());
        assert!(vms.get("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_patch_and_delete() {
        let vms: Api<VirtualMachine> = Api::namespaced(store(), "default");
        vms.create(&VirtualMachine::new("default", "vm-a", VirtualMachineSpec::default()))
            .await
            .unwrap();

        let mut b = PatchBuilder::new();
        b.add(&["spec", "running"], json!(true));
        let patched = vms.patch("vm-a", &b.build()).await.unwrap();
        assert!(patched.is_run_requested());

        assert!(vms.delete_opt("vm-a").await.unwrap());
        assert!(!vms.delete_opt("vm-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_cluster_scoped_kind() {
        let classes: Api<StorageClass> = Api::cluster(store());
        classes
            .create(&StorageClass::new("wffc", VolumeBindingMode::WaitForFirstConsumer, true))
            .await
            .unwrap();
        let sc = classes.get("wffc").await.unwrap();
        assert_eq!(sc.volume_binding_mode, VolumeBindingMode::WaitForFirstConsumer);
        assert_eq!(sc.metadata.namespace, "");
    }

    #[tokio::test]
    async fn test_replace_rejects_foreign_namespace() {
        let s = store();
        let vms: Api<VirtualMachine> = Api::namespaced(Arc::clone(&s), "default");
        let other: Api<VirtualMachine> = Api::namespaced(s, "other");
        let created = vms
            .create(&VirtualMachine {
                metadata: ObjectMeta::named("default", "vm-a"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(matches!(
            other.replace(&created).await.unwrap_err(),
            StoreError::Invalid(_)
        ));
    }
}
