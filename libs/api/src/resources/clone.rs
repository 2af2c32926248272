//! VirtualMachineClone.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{impl_resource, Conditions, ObjectMeta, TypedLocalObjectReference};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineClone {
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineCloneSpec,
    #[serde(default)]
    pub status: VirtualMachineCloneStatus,
}

impl_resource!(VirtualMachineClone, "VirtualMachineClone");

impl VirtualMachineClone {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: TypedLocalObjectReference,
        target_vm: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec: VirtualMachineCloneSpec {
                source,
                target: Some(TypedLocalObjectReference::new("VirtualMachine", target_vm)),
                ..Default::default()
            },
            status: VirtualMachineCloneStatus::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineCloneSpec {
    /// A VirtualMachine or a VirtualMachineSnapshot.
    pub source: TypedLocalObjectReference,

    /// Target VM; a name is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TypedLocalObjectReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_filters: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotation_filters: Vec<String>,

    #[serde(default)]
    pub template: CloneTemplateFilters,

    /// Interface name to MAC address.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub new_mac_addresses: BTreeMap<String, String>,

    #[serde(rename = "newSMBiosSerial", default, skip_serializing_if = "Option::is_none")]
    pub new_smbios_serial: Option<String>,
}

impl Default for VirtualMachineCloneSpec {
    fn default() -> Self {
        Self {
            source: TypedLocalObjectReference::new("VirtualMachine", ""),
            target: None,
            label_filters: Vec::new(),
            annotation_filters: Vec::new(),
            template: CloneTemplateFilters::default(),
            new_mac_addresses: BTreeMap::new(),
            new_smbios_serial: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneTemplateFilters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_filters: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotation_filters: Vec<String>,
}

/// Clone lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClonePhase {
    /// Not yet reconciled.
    #[default]
    #[serde(rename = "")]
    Unset,
    SnapshotInProgress,
    RestoreInProgress,
    Succeeded,
    Failed,
}

impl ClonePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::SnapshotInProgress => "SnapshotInProgress",
            Self::RestoreInProgress => "RestoreInProgress",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for ClonePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineCloneStatus {
    #[serde(default)]
    pub phase: ClonePhase,

    /// Snapshot created by this clone; `None` for snapshot sources and
    /// after cleanup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
}
