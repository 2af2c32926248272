//! VirtualMachineRestore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{impl_resource, Conditions, ObjectMeta, TypedLocalObjectReference};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRestore {
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineRestoreSpec,
    #[serde(default)]
    pub status: VirtualMachineRestoreStatus,
}

impl_resource!(VirtualMachineRestore, "VirtualMachineRestore");

impl VirtualMachineRestore {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        target_vm: impl Into<String>,
        snapshot_name: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec: VirtualMachineRestoreSpec {
                target: TypedLocalObjectReference::new("VirtualMachine", target_vm),
                virtual_machine_snapshot_name: snapshot_name.into(),
                patches: Vec::new(),
            },
            status: VirtualMachineRestoreStatus::default(),
        }
    }

    pub fn with_patches(mut self, patches: Vec<String>) -> Self {
        self.spec.patches = patches;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.status.complete
    }

    /// Neither complete nor failed. Only pending restores hold their target:
    /// a failed restore stops gating starts and new restores.
    pub fn is_pending(&self) -> bool {
        !self.is_complete() && !self.is_failed()
    }

    /// True if the restore has reported a failure on its Ready condition.
    pub fn is_failed(&self) -> bool {
        self.status
            .conditions
            .as_ref()
            .is_some_and(|c| !c.is_progressing() && !c.is_ready() && !self.status.complete)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRestoreSpec {
    pub target: TypedLocalObjectReference,

    pub virtual_machine_snapshot_name: String,

    /// JSON-Patch operations, one serialized operation per entry, applied in
    /// order to the restored VM.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<String>,
}

impl Default for VirtualMachineRestoreSpec {
    fn default() -> Self {
        Self {
            target: TypedLocalObjectReference::new("VirtualMachine", ""),
            virtual_machine_snapshot_name: String::new(),
            patches: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRestoreStatus {
    #[serde(default)]
    pub complete: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,

    #[serde(default)]
    pub restores: Vec<VolumeRestore>,

    #[serde(default)]
    pub deleted_data_volumes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRestore {
    pub volume_name: String,
    pub persistent_volume_claim: String,
    pub volume_snapshot_name: String,
    /// Set when the restored claim backs a DataVolume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume_name: Option<String>,
}
