//! Owner-reference garbage collection.
//!
//! An object whose owner references all point at uids no longer in the
//! store is deleted. Deleting it may orphan its own dependents, so a pass
//! repeats until nothing more goes.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::{debug, info};
use virtops_api::{ObjectKey, ObjectMeta, StoreError};
use virtops_id::Uid;

use crate::context::Context;
use crate::error::ControllerResult;
use crate::worker::{ReconcileLoop, ReconcileStats};

pub struct GarbageCollector {
    ctx: Context,
}

impl GarbageCollector {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Deletes orphaned dependents across all kinds and namespaces; returns
    /// how many objects went.
    pub async fn collect(&self) -> ControllerResult<u64> {
        let mut deleted = 0u64;
        loop {
            let objects = self.ctx.store().list_all().await?;
            let mut metas = Vec::with_capacity(objects.len());
            for (kind, object) in objects {
                let meta: ObjectMeta = serde_json::from_value(object["metadata"].clone())
                    .map_err(StoreError::from)?;
                metas.push((kind, meta));
            }
            let live: BTreeSet<Uid> = metas.iter().filter_map(|(_, m)| m.uid).collect();

            let mut round = 0u64;
            for (kind, meta) in &metas {
                if meta.owner_references.is_empty()
                    || meta.owner_references.iter().any(|o| live.contains(&o.uid))
                {
                    continue;
                }
                let key = ObjectKey::new(kind.clone(), meta.namespace.clone(), meta.name.clone());
                match self.ctx.store().delete(&key).await {
                    Ok(_) => {
                        debug!(object = %key, "Deleted orphaned dependent");
                        round += 1;
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }

            if round == 0 {
                break;
            }
            deleted += round;
        }

        if deleted > 0 {
            info!(deleted, "Garbage collection pass complete");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl ReconcileLoop for GarbageCollector {
    fn name(&self) -> &'static str {
        "gc"
    }

    async fn reconcile_all(&self) -> ControllerResult<ReconcileStats> {
        let deleted = self.collect().await?;
        Ok(ReconcileStats {
            processed: usize::try_from(deleted).unwrap_or(usize::MAX),
            ..Default::default()
        })
    }
}
