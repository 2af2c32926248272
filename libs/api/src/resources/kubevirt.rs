//! KubeVirt install configuration.

use serde::{Deserialize, Serialize};

use crate::{impl_resource, ObjectMeta};

/// Operator configuration; its `customizeComponents` patches drive
/// component template changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirt {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: KubeVirtSpec,
}

impl_resource!(KubeVirt, "KubeVirt");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtSpec {
    #[serde(default)]
    pub customize_components: CustomizeComponents,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomizeComponents {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<CustomizeComponentsPatch>,
}

impl CustomizeComponents {
    /// Patches addressed to one component, in declaration order.
    pub fn patches_for<'a>(
        &'a self,
        resource_type: &'a str,
        resource_name: &'a str,
    ) -> impl Iterator<Item = &'a CustomizeComponentsPatch> + 'a {
        self.patches
            .iter()
            .filter(move |p| p.resource_type == resource_type && p.resource_name == resource_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomizeComponentsPatch {
    pub resource_name: String,
    pub resource_type: String,
    /// Patch document applied to the whole component object.
    pub patch: String,
    #[serde(rename = "type")]
    pub patch_type: PatchType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    Json,
    Merge,
    /// Applied with merge semantics.
    Strategic,
}
