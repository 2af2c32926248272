//! PersistentVolumeClaim, StorageClass and VolumeSnapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{impl_resource, ObjectMeta, ResourceRequirements, TypedLocalObjectReference};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaim {
    pub metadata: ObjectMeta,
    pub spec: PersistentVolumeClaimSpec,
    #[serde(default)]
    pub status: PersistentVolumeClaimStatus,
}

impl_resource!(PersistentVolumeClaim, "PersistentVolumeClaim");

impl PersistentVolumeClaim {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        storage_class: Option<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec: PersistentVolumeClaimSpec {
                storage_class_name: storage_class,
                ..Default::default()
            },
            status: PersistentVolumeClaimStatus::default(),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.status.phase == ClaimPhase::Bound
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// VolumeSnapshot the claim is populated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<TypedLocalObjectReference>,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Lost,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,
}

// =============================================================================
// StorageClass
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeBindingMode {
    #[default]
    Immediate,
    WaitForFirstConsumer,
}

/// Cluster-scoped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClass {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub volume_binding_mode: VolumeBindingMode,
    /// Whether a snapshot class exists for this provisioner.
    #[serde(default)]
    pub snapshot_supported: bool,
}

impl_resource!(StorageClass, "StorageClass");

impl StorageClass {
    pub fn new(name: impl Into<String>, mode: VolumeBindingMode, snapshot_supported: bool) -> Self {
        Self {
            metadata: ObjectMeta::named("", name),
            volume_binding_mode: mode,
            snapshot_supported,
        }
    }
}

// =============================================================================
// VolumeSnapshot
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshot {
    pub metadata: ObjectMeta,
    pub spec: VolumeSnapshotSpec,
    #[serde(default)]
    pub status: VolumeSnapshotStatus,
}

impl_resource!(VolumeSnapshot, "VolumeSnapshot");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    pub persistent_volume_claim_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    #[serde(default)]
    pub ready_to_use: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
