//! The `Resource` trait implemented by every stored type.

use serde::de::DeserializeOwned;
use serde::Serialize;
use virtops_events::ObjectReference;

use crate::{ObjectKey, ObjectMeta, OwnerReference};

/// A typed object that lives in the store.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind name, also the store partition.
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn namespace(&self) -> &str {
        &self.meta().namespace
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::new(Self::KIND, self.namespace(), self.name())
    }

    /// Reference used when recording events about this object.
    fn object_ref(&self) -> ObjectReference {
        let r = ObjectReference::new(Self::KIND, self.namespace(), self.name());
        match self.meta().uid {
            Some(uid) => r.with_uid(uid),
            None => r,
        }
    }

    /// Controller owner reference pointing at this object.
    ///
    /// `None` until the object has been created and holds a uid.
    fn controller_ref(&self) -> Option<OwnerReference> {
        let uid = self.meta().uid?;
        Some(OwnerReference {
            kind: Self::KIND.to_string(),
            name: self.name().to_string(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

/// Implements [`Resource`] for a struct with a `metadata: ObjectMeta` field.
#[macro_export]
macro_rules! impl_resource {
    ($ty:ty, $kind:literal) => {
        impl $crate::Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &$crate::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut $crate::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}
