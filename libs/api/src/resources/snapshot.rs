//! VirtualMachineSnapshot and VirtualMachineSnapshotContent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use virtops_id::Uid;

use crate::{impl_resource, ObjectMeta, TemplateMeta, TypedLocalObjectReference, VirtualMachineSpec};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshot {
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineSnapshotSpec,
    #[serde(default)]
    pub status: VirtualMachineSnapshotStatus,
}

impl_resource!(VirtualMachineSnapshot, "VirtualMachineSnapshot");

impl VirtualMachineSnapshot {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, vm_name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec: VirtualMachineSnapshotSpec {
                source: TypedLocalObjectReference::new("VirtualMachine", vm_name),
            },
            status: VirtualMachineSnapshotStatus::default(),
        }
    }

    pub fn is_ready_to_use(&self) -> bool {
        self.status.ready_to_use
    }

    pub fn is_failed(&self) -> bool {
        self.status.phase == Some(SnapshotPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotSpec {
    pub source: TypedLocalObjectReference,
}

impl Default for VirtualMachineSnapshotSpec {
    fn default() -> Self {
        Self {
            source: TypedLocalObjectReference::new("VirtualMachine", ""),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPhase {
    InProgress,
    Succeeded,
    Failed,
}

impl SnapshotPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "InProgress",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SnapshotPhase>,

    #[serde(default)]
    pub ready_to_use: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_content_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uid: Option<Uid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SnapshotError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

// =============================================================================
// Content
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContent {
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineSnapshotContentSpec,
    #[serde(default)]
    pub status: VirtualMachineSnapshotContentStatus,
}

impl_resource!(VirtualMachineSnapshotContent, "VirtualMachineSnapshotContent");

impl VirtualMachineSnapshotContent {
    /// Backup recorded for `volume_name`, if any.
    pub fn backup_for(&self, volume_name: &str) -> Option<&VolumeBackup> {
        self.spec
            .volume_backups
            .iter()
            .find(|b| b.volume_name == volume_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentSpec {
    pub virtual_machine_snapshot_name: String,
    pub source: SnapshotContentSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_backups: Vec<VolumeBackup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotContentSource {
    pub virtual_machine: CapturedVirtualMachine,
}

/// Deep copy of a VM taken at snapshot time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedVirtualMachine {
    pub name: String,
    #[serde(default)]
    pub metadata: TemplateMeta,
    pub spec: VirtualMachineSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackup {
    pub volume_name: String,
    pub persistent_volume_claim: BackedUpClaim,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackedUpClaim {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentStatus {
    #[serde(default)]
    pub ready_to_use: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SnapshotError>,
}
