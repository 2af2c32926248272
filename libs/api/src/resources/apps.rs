//! DaemonSet, Pod and Node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use virtops_id::Generation;
use virtops_reconcile::IntOrString;

use crate::{impl_resource, ObjectMeta};

/// Label carrying the template hash a pod was created from.
pub const CONTROLLER_REVISION_HASH: &str = "controller-revision-hash";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSet {
    pub metadata: ObjectMeta,
    pub spec: DaemonSetSpec,
    #[serde(default)]
    pub status: DaemonSetStatus,
}

impl_resource!(DaemonSet, "DaemonSet");

impl DaemonSet {
    pub fn max_unavailable(&self) -> &IntOrString {
        &self.spec.update_strategy.rolling_update.max_unavailable
    }

    pub fn set_max_unavailable(&mut self, value: IntOrString) {
        self.spec.update_strategy.rolling_update.max_unavailable = value;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetSpec {
    /// Pod template, kept opaque.
    pub template: serde_json::Value,
    #[serde(default)]
    pub update_strategy: DaemonSetUpdateStrategy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetUpdateStrategy {
    #[serde(default)]
    pub rolling_update: RollingUpdateDaemonSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateDaemonSet {
    pub max_unavailable: IntOrString,
}

impl Default for RollingUpdateDaemonSet {
    fn default() -> Self {
        Self {
            max_unavailable: IntOrString::Int(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetStatus {
    #[serde(default)]
    pub desired_number_scheduled: i32,
    #[serde(default)]
    pub number_ready: i32,
    #[serde(default)]
    pub updated_number_scheduled: i32,
    #[serde(default)]
    pub number_unavailable: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<Generation>,
}

// =============================================================================
// Pod
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl_resource!(Pod, "Pod");

impl Pod {
    pub fn revision_hash(&self) -> Option<&str> {
        self.metadata
            .labels
            .get(CONTROLLER_REVISION_HASH)
            .map(String::as_str)
    }

    pub fn is_ready(&self) -> bool {
        self.status.ready
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub node_name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub template: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Node
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeSpec,
}

impl_resource!(Node, "Node");

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named("", name),
            spec: NodeSpec::default(),
        }
    }

    pub fn is_schedulable(&self) -> bool {
        !self.spec.unschedulable
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    #[serde(default)]
    pub unschedulable: bool,
}
