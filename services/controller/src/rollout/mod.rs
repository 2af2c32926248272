//! Canary rollouts of component DaemonSets.
//!
//! The desired pod template of each DaemonSet is its install template (the
//! template first seen, kept in an annotation) with the KubeVirt
//! `customizeComponents` patches applied. A difference between desired and
//! current template starts a staged rollout.

mod coordinator;
mod plan;
mod stage;
mod template;

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};
use virtops_api::{Api, CustomizeComponents, DaemonSet, KubeVirt, Resource};
use virtops_reconcile::{Action, RequeueSchedule};

pub use coordinator::RolloutCoordinator;
pub use plan::plan_replacements;
pub use stage::{
    RolloutStage, RolloutState, HASH_ANNOTATION, STAGE_ANNOTATION, STARTED_AT_ANNOTATION,
    STUCK_ANNOTATION,
};
pub use template::{desired_template, DAEMONSET_RESOURCE_TYPE};

use crate::config::RolloutConfig;
use crate::context::Context;
use crate::error::{ControllerError, ControllerResult};
use crate::worker::{lock, ReconcileLoop, ReconcileStats};

/// DaemonSet annotation holding the template before any customization.
pub const INSTALL_TEMPLATE_ANNOTATION: &str = "virtops.io/install-template";

pub struct RolloutReconciler {
    ctx: Context,
    namespace: String,
    coordinator: RolloutCoordinator,
    schedule: Mutex<RequeueSchedule>,
}

impl RolloutReconciler {
    pub fn new(ctx: Context, namespace: impl Into<String>, config: RolloutConfig) -> Self {
        let namespace = namespace.into();
        Self {
            coordinator: RolloutCoordinator::new(ctx.clone(), namespace.clone(), config),
            ctx,
            namespace,
            schedule: Mutex::new(RequeueSchedule::new()),
        }
    }

    fn daemonsets(&self) -> Api<DaemonSet> {
        self.ctx.api(&self.namespace)
    }

    async fn components(&self) -> ControllerResult<CustomizeComponents> {
        let kubevirts: Vec<KubeVirt> = self.ctx.api(&self.namespace).list().await?;
        Ok(kubevirts
            .into_iter()
            .next()
            .map(|kv| kv.spec.customize_components)
            .unwrap_or_default())
    }

    pub async fn reconcile(
        &self,
        ds: &DaemonSet,
        components: &CustomizeComponents,
    ) -> ControllerResult<Action> {
        let Some(raw) = ds.metadata.annotations.get(INSTALL_TEMPLATE_ANNOTATION) else {
            let mut updated = ds.clone();
            updated.metadata.annotations.insert(
                INSTALL_TEMPLATE_ANNOTATION.to_string(),
                serde_json::to_string(&ds.spec.template).map_err(virtops_api::StoreError::from)?,
            );
            self.daemonsets().replace(&updated).await?;
            info!(daemonset = %ds.name(), "Recorded install template");
            return Ok(Action::AwaitChange);
        };

        let base: Value = serde_json::from_str(raw).map_err(|e| {
            ControllerError::invalid(
                DaemonSet::KIND,
                ds.name(),
                format!("unreadable install template: {e}"),
            )
        })?;
        let desired = desired_template(&base, ds.name(), components)?;
        self.coordinator.reconcile(ds, &desired).await
    }
}

#[async_trait]
impl ReconcileLoop for RolloutReconciler {
    fn name(&self) -> &'static str {
        "rollout"
    }

    async fn reconcile_all(&self) -> ControllerResult<ReconcileStats> {
        let components = self.components().await?;
        let daemonsets = self.daemonsets().list().await?;
        let mut stats = ReconcileStats::default();
        let now = Instant::now();
        lock(&self.schedule).retain_keys(daemonsets.iter().map(|d| d.name()));

        for ds in &daemonsets {
            let key = ds.name();
            if !lock(&self.schedule).is_due(key, now) {
                stats.deferred += 1;
                continue;
            }
            match self.reconcile(ds, &components).await {
                Ok(action) => {
                    lock(&self.schedule).schedule(key, action, Instant::now());
                    stats.processed += 1;
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(daemonset = %key, error = %e, "Failed to reconcile rollout");
                }
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use virtops_api::{
        CustomizeComponentsPatch, DaemonSetSpec, KubeVirtSpec, Node, ObjectMeta, PatchType,
        SqliteStore,
    };
    use virtops_events::MemoryRecorder;

    use super::*;

    fn reconciler() -> (Context, RolloutReconciler) {
        let ctx = Context::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(MemoryRecorder::new()),
        );
        let r = RolloutReconciler::new(ctx.clone(), "default", RolloutConfig::default());
        (ctx, r)
    }

    fn base() -> Value {
        json!({ "spec": { "containers": [ { "name": "handler", "image": "v1" } ] } })
    }

    async fn seed(ctx: &Context) {
        ctx.cluster_api::<Node>().create(&Node::new("node-0")).await.unwrap();
        let ds = DaemonSet {
            metadata: ObjectMeta::named("default", "virt-handler"),
            spec: DaemonSetSpec {
                template: base(),
                ..Default::default()
            },
            status: Default::default(),
        };
        ctx.api::<DaemonSet>("default").create(&ds).await.unwrap();
    }

    #[tokio::test]
    async fn test_install_template_recorded_before_anything_else() {
        let (ctx, r) = reconciler();
        seed(&ctx).await;

        let stats = r.reconcile_all().await.unwrap();
        assert_eq!(stats.processed, 1);
        let ds: DaemonSet = ctx.api("default").get("virt-handler").await.unwrap();
        let recorded: Value =
            serde_json::from_str(&ds.metadata.annotations[INSTALL_TEMPLATE_ANNOTATION]).unwrap();
        assert_eq!(recorded, base());
        assert!(ctx.api::<virtops_api::Pod>("default").list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_customization_starts_rollout_and_removal_reverts() {
        let (ctx, r) = reconciler();
        seed(&ctx).await;
        r.reconcile_all().await.unwrap();
        r.reconcile_all().await.unwrap();

        let kv = KubeVirt {
            metadata: ObjectMeta::named("default", "kubevirt"),
            spec: KubeVirtSpec {
                customize_components: CustomizeComponents {
                    patches: vec![CustomizeComponentsPatch {
                        resource_name: "virt-handler".to_string(),
                        resource_type: DAEMONSET_RESOURCE_TYPE.to_string(),
                        patch: r#"{"spec":{"template":{"metadata":{"annotations":{"debug":"true"}}}}}"#
                            .to_string(),
                        patch_type: PatchType::Merge,
                    }],
                },
            },
        };
        let kvs: Api<KubeVirt> = ctx.api("default");
        let mut kv = kvs.create(&kv).await.unwrap();

        r.reconcile_all().await.unwrap();
        let ds: DaemonSet = ctx.api("default").get("virt-handler").await.unwrap();
        assert_eq!(ds.spec.template["metadata"]["annotations"]["debug"], "true");
        assert_eq!(ds.metadata.annotations[STAGE_ANNOTATION], "Canary");

        kv.spec.customize_components = CustomizeComponents::default();
        kvs.replace(&kv).await.unwrap();
        r.reconcile_all().await.unwrap();
        let ds: DaemonSet = ctx.api("default").get("virt-handler").await.unwrap();
        assert_eq!(ds.spec.template, base());
    }

    #[tokio::test]
    async fn test_unreadable_install_template_counts_as_failure() {
        let (ctx, r) = reconciler();
        seed(&ctx).await;
        let api: Api<DaemonSet> = ctx.api("default");
        let mut ds = api.get("virt-handler").await.unwrap();
        ds.metadata
            .annotations
            .insert(INSTALL_TEMPLATE_ANNOTATION.to_string(), "{".to_string());
        api.replace(&ds).await.unwrap();

        let stats = r.reconcile_all().await.unwrap();
        assert_eq!(stats.failed, 1);
    }
}
