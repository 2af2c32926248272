//! Staged rollout of a DaemonSet template.
//!
//! A template change moves the DaemonSet through three stages, each entered
//! with its own store write so every `maxUnavailable` value is visible to
//! watchers:
//!
//! | Stage    | maxUnavailable | Leaves when                              |
//! |----------|----------------|------------------------------------------|
//! | Canary   | 1              | an updated pod is ready                  |
//! | Widened  | 10%            | old pods left <= safety margin           |
//! | Narrowed | 1              | all pods updated and ready               |
//!
//! The coordinator also stands in for the DaemonSet controller: it keeps
//! one pod per schedulable node and recomputes the DaemonSet status.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use virtops_api::{Api, DaemonSet, Node, ObjectMeta, Pod, PodSpec, Resource, CONTROLLER_REVISION_HASH};
use virtops_events::reasons;
use virtops_reconcile::{classify_by_hash, Action, ConvergenceStatus, IntOrString, SpecHash};

use super::plan::plan_replacements;
use super::stage::{RolloutStage, RolloutState, STEADY_MAX_UNAVAILABLE};
use crate::config::RolloutConfig;
use crate::context::Context;
use crate::error::{ControllerError, ControllerResult};

pub struct RolloutCoordinator {
    ctx: Context,
    namespace: String,
    config: RolloutConfig,
}

impl RolloutCoordinator {
    pub fn new(ctx: Context, namespace: impl Into<String>, config: RolloutConfig) -> Self {
        Self {
            ctx,
            namespace: namespace.into(),
            config,
        }
    }

    fn daemonsets(&self) -> Api<DaemonSet> {
        self.ctx.api(&self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        self.ctx.api(&self.namespace)
    }

    /// Drives `ds` one step towards running `desired` on every node.
    #[instrument(skip(self, ds, desired), fields(daemonset = %ds.name()))]
    pub async fn reconcile(&self, ds: &DaemonSet, desired: &Value) -> ControllerResult<Action> {
        let desired_hash = SpecHash::from_json(desired);
        if SpecHash::from_json(&ds.spec.template) != desired_hash {
            self.start(ds, desired, desired_hash).await?;
            return Ok(Action::AwaitChange);
        }

        let pods = self.sync_pods(ds, &desired_hash).await?;
        let ds = self.refresh_status(ds, &pods, &desired_hash).await?;

        let tagged: Vec<(&Pod, Option<SpecHash>)> = pods
            .iter()
            .map(|p| (p, p.revision_hash().map(SpecHash::from_raw)))
            .collect();
        let (updated, old) = classify_by_hash(tagged, &desired_hash, |(_, h)| h.as_ref());
        let updated: Vec<&Pod> = updated.into_iter().map(|(p, _)| p).collect();
        let old: Vec<&Pod> = old.into_iter().map(|(p, _)| p).collect();

        let Some(state) = RolloutState::read(&ds.metadata.annotations) else {
            self.replace_old(&ds, ds.max_unavailable(), old).await?;
            return Ok(Action::AwaitChange);
        };

        if let Some(state) = self.check_stuck(&ds, &state) {
            self.write_state(&ds, &state).await?;
            return Ok(Action::AwaitChange);
        }

        match state.stage {
            RolloutStage::Canary if updated.iter().any(|p| p.is_ready()) => {
                self.enter_stage(&ds, &state, RolloutStage::Widened).await?;
                return Ok(Action::AwaitChange);
            }
            RolloutStage::Widened if old.len() <= self.config.safety_margin => {
                self.enter_stage(&ds, &state, RolloutStage::Narrowed).await?;
                return Ok(Action::AwaitChange);
            }
            RolloutStage::Narrowed if old.is_empty() && convergence(&ds).is_converged() => {
                self.complete(&ds).await?;
                return Ok(Action::AwaitChange);
            }
            _ => {}
        }

        self.replace_old(&ds, &state.stage.max_unavailable(), old).await?;
        Ok(Action::AwaitChange)
    }

    // =========================================================================
    // Stage transitions
    // =========================================================================

    async fn start(&self, ds: &DaemonSet, desired: &Value, hash: SpecHash) -> ControllerResult<()> {
        let restarted = RolloutState::read(&ds.metadata.annotations).is_some();
        let state = RolloutState::begin(hash, Utc::now());

        let mut updated = ds.clone();
        updated.spec.template = desired.clone();
        updated.set_max_unavailable(RolloutStage::Canary.max_unavailable());
        state.write(&mut updated.metadata.annotations);
        let updated = self.daemonsets().replace(&updated).await?;

        info!(
            daemonset = %ds.name(),
            hash = %state.hash,
            restarted,
            "Rollout started"
        );
        self.ctx.recorder().normal(
            &updated.object_ref(),
            reasons::ROLLOUT_STARTED,
            &format!("Rolling out template {} one node at a time", state.hash),
        );
        Ok(())
    }

    async fn enter_stage(
        &self,
        ds: &DaemonSet,
        state: &RolloutState,
        stage: RolloutStage,
    ) -> ControllerResult<()> {
        let next = state.advance(stage, Utc::now());
        let mut updated = ds.clone();
        updated.set_max_unavailable(stage.max_unavailable());
        next.write(&mut updated.metadata.annotations);
        let updated = self.daemonsets().replace(&updated).await?;

        info!(
            daemonset = %ds.name(),
            from = %state.stage,
            to = %stage,
            max_unavailable = %stage.max_unavailable(),
            "Rollout stage transition"
        );
        let (reason, message) = match stage {
            RolloutStage::Widened => (
                reasons::ROLLOUT_WIDENED,
                format!("Canary is ready, widening to {}", stage.max_unavailable()),
            ),
            _ => (
                reasons::ROLLOUT_NARROWED,
                "Narrowing to one node at a time".to_string(),
            ),
        };
        self.ctx
            .recorder()
            .normal(&updated.object_ref(), reason, &message);
        Ok(())
    }

    async fn complete(&self, ds: &DaemonSet) -> ControllerResult<()> {
        let mut updated = ds.clone();
        RolloutState::clear(&mut updated.metadata.annotations);
        updated.set_max_unavailable(IntOrString::Int(STEADY_MAX_UNAVAILABLE));
        let updated = self.daemonsets().replace(&updated).await?;

        info!(daemonset = %ds.name(), "Rollout complete");
        self.ctx.recorder().normal(
            &updated.object_ref(),
            reasons::ROLLOUT_COMPLETE,
            "All pods are running the current template",
        );
        Ok(())
    }

    /// Returns the state to persist when the current stage just became
    /// stuck. The budget covers every scheduled node and runs from stage
    /// entry.
    fn check_stuck(&self, ds: &DaemonSet, state: &RolloutState) -> Option<RolloutState> {
        if state.stuck_reported == Some(state.stage) {
            return None;
        }
        let nodes = u32::try_from(ds.status.desired_number_scheduled.max(1)).unwrap_or(1);
        let limit = self.config.per_node_timeout.saturating_mul(nodes);
        let elapsed = (Utc::now() - state.started_at).to_std().ok()?;
        if elapsed <= limit {
            return None;
        }

        warn!(
            daemonset = %ds.name(),
            stage = %state.stage,
            elapsed_secs = elapsed.as_secs(),
            "Rollout is stuck"
        );
        self.ctx.recorder().warning(
            &ds.object_ref(),
            reasons::ROLLOUT_STUCK,
            &format!(
                "Rollout in stage {} has not finished after {}s",
                state.stage,
                elapsed.as_secs()
            ),
        );
        Some(RolloutState {
            stuck_reported: Some(state.stage),
            ..state.clone()
        })
    }

    async fn write_state(&self, ds: &DaemonSet, state: &RolloutState) -> ControllerResult<()> {
        let mut updated = ds.clone();
        state.write(&mut updated.metadata.annotations);
        self.daemonsets().replace(&updated).await?;
        Ok(())
    }

    // =========================================================================
    // Pods and status
    // =========================================================================

    /// One pod per schedulable node; pods on other nodes are removed.
    async fn sync_pods(&self, ds: &DaemonSet, hash: &SpecHash) -> ControllerResult<Vec<Pod>> {
        let uid = ds.metadata.uid.ok_or_else(|| {
            ControllerError::invalid(DaemonSet::KIND, ds.name(), "object has no uid")
        })?;
        let owner = ds.controller_ref().ok_or_else(|| {
            ControllerError::invalid(DaemonSet::KIND, ds.name(), "object has no uid")
        })?;

        let nodes: Vec<Node> = self.ctx.cluster_api::<Node>().list().await?;
        let schedulable: BTreeMap<&str, &Node> = nodes
            .iter()
            .filter(|n| n.is_schedulable())
            .map(|n| (n.name(), n))
            .collect();

        let mut pods = Vec::new();
        for pod in self.pods().list().await? {
            if !pod.metadata.is_owned_by(&uid) {
                continue;
            }
            if schedulable.contains_key(pod.spec.node_name.as_str()) {
                pods.push(pod);
            } else {
                info!(pod = %pod.name(), node = %pod.spec.node_name, "Removing pod from unschedulable node");
                self.pods().delete_opt(pod.name()).await?;
            }
        }

        for node in schedulable.keys() {
            if pods.iter().any(|p| p.spec.node_name == *node) {
                continue;
            }
            let mut metadata = ObjectMeta::named(&self.namespace, format!("{}-{}", ds.name(), node))
                .with_owner(owner.clone());
            metadata
                .labels
                .insert(CONTROLLER_REVISION_HASH.to_string(), hash.to_string());
            let pod = Pod {
                metadata,
                spec: PodSpec {
                    node_name: node.to_string(),
                    template: ds.spec.template.clone(),
                },
                status: Default::default(),
            };
            let created = self.pods().create(&pod).await?;
            debug!(pod = %created.name(), node = %node, hash = %hash, "Created pod");
            pods.push(created);
        }

        Ok(pods)
    }

    async fn refresh_status(
        &self,
        ds: &DaemonSet,
        pods: &[Pod],
        hash: &SpecHash,
    ) -> ControllerResult<DaemonSet> {
        let desired = count(pods.len());
        let ready = count(pods.iter().filter(|p| p.is_ready()).count());
        let updated = count(
            pods.iter()
                .filter(|p| p.revision_hash() == Some(hash.as_str()))
                .count(),
        );

        let mut next = ds.clone();
        next.status.desired_number_scheduled = desired;
        next.status.number_ready = ready;
        next.status.updated_number_scheduled = updated;
        next.status.number_unavailable = (desired - ready).max(0);
        next.status.observed_generation = ds.metadata.generation;

        if next.status == ds.status {
            return Ok(next);
        }
        debug!(
            daemonset = %ds.name(),
            desired,
            ready,
            updated,
            "Updating DaemonSet status"
        );
        Ok(self.daemonsets().replace_status(&next).await?)
    }

    async fn replace_old(
        &self,
        ds: &DaemonSet,
        max_unavailable: &IntOrString,
        old: Vec<&Pod>,
    ) -> ControllerResult<()> {
        if old.is_empty() {
            return Ok(());
        }
        let planned = plan_replacements(
            max_unavailable,
            ds.status.desired_number_scheduled,
            ds.status.number_ready,
            old,
        )?;
        for pod in planned {
            info!(
                daemonset = %ds.name(),
                pod = %pod.name(),
                node = %pod.spec.node_name,
                ready = pod.is_ready(),
                "Replacing old pod"
            );
            self.pods().delete_opt(pod.name()).await?;
        }
        Ok(())
    }
}

/// Whether every scheduled pod runs the current template and is ready.
fn convergence(ds: &DaemonSet) -> ConvergenceStatus {
    let status = &ds.status;
    if status.desired_number_scheduled == status.number_ready
        && status.desired_number_scheduled == status.updated_number_scheduled
    {
        ConvergenceStatus::Converged
    } else {
        ConvergenceStatus::Converging
    }
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
