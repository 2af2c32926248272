//! Object metadata, references, and status conditions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use virtops_id::{Generation, ResourceVersion, Uid};

/// Store key of one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {:?}", self.kind, self.name)
        } else {
            write!(f, "{} {}/{:?}", self.kind, self.namespace, self.name)
        }
    }
}

/// Standard object metadata.
///
/// `uid`, `resourceVersion`, `generation` and `creationTimestamp` are owned
/// by the store; values supplied by callers on create are overwritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    /// Empty for cluster-scoped objects.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<ResourceVersion>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner_references.push(owner);
        self
    }

    /// True if `uid` appears among the owner references.
    pub fn is_owned_by(&self, uid: &Uid) -> bool {
        self.owner_references.iter().any(|o| &o.uid == uid)
    }
}

/// Link from a dependent to its owner; drives cascade deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: Uid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

/// Reference to an object in the same namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedLocalObjectReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

impl TypedLocalObjectReference {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_group: None,
            kind: kind.into(),
            name: name.into(),
        }
    }
}

// =============================================================================
// Conditions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Progressing,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(b: bool) -> Self {
        if b {
            Self::True
        } else {
            Self::False
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    fn new(condition_type: ConditionType, status: ConditionStatus, reason: &str) -> Self {
        Self {
            condition_type,
            status,
            reason: reason.to_string(),
            message: String::new(),
            last_transition_time: Some(Utc::now()),
        }
    }

    fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// The fixed `[Progressing, Ready]` condition pair.
///
/// Serialized as a two-element array; any other shape fails to
/// deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct Conditions {
    progressing: Condition,
    ready: Condition,
}

impl Conditions {
    pub fn new(
        progressing: impl Into<ConditionStatus>,
        ready: impl Into<ConditionStatus>,
        reason: &str,
    ) -> Self {
        Self {
            progressing: Condition::new(ConditionType::Progressing, progressing.into(), reason),
            ready: Condition::new(ConditionType::Ready, ready.into(), reason),
        }
    }

    /// Next pair, keeping transition times of conditions whose status did
    /// not change.
    pub fn transition(
        previous: Option<&Conditions>,
        progressing: impl Into<ConditionStatus>,
        ready: impl Into<ConditionStatus>,
        reason: &str,
    ) -> Self {
        let mut next = Self::new(progressing, ready, reason);
        if let Some(prev) = previous {
            if prev.progressing.status == next.progressing.status {
                next.progressing.last_transition_time = prev.progressing.last_transition_time;
            }
            if prev.ready.status == next.ready.status {
                next.ready.last_transition_time = prev.ready.last_transition_time;
            }
        }
        next
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.progressing.message = message.clone();
        self.ready.message = message;
        self
    }

    pub fn progressing(&self) -> &Condition {
        &self.progressing
    }

    pub fn ready(&self) -> &Condition {
        &self.ready
    }

    pub fn is_progressing(&self) -> bool {
        self.progressing.is_true()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_true()
    }
}

impl TryFrom<Vec<Condition>> for Conditions {
    type Error = String;

    fn try_from(value: Vec<Condition>) -> Result<Self, Self::Error> {
        let [progressing, ready]: [Condition; 2] = value
            .try_into()
            .map_err(|v: Vec<Condition>| format!("expected 2 conditions, got {}", v.len()))?;
        if progressing.condition_type != ConditionType::Progressing
            || ready.condition_type != ConditionType::Ready
        {
            return Err("conditions must be [Progressing, Ready]".to_string());
        }
        Ok(Self { progressing, ready })
    }
}

impl From<Conditions> for Vec<Condition> {
    fn from(c: Conditions) -> Self {
        vec![c.progressing, c.ready]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditions_wire_order() {
        let c = Conditions::new(true, false, "Operation in progress");
        let json = serde_json::to_value(&c).unwrap();
        let arr = json.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["type"], "Progressing");
        assert_eq!(arr[0]["status"], "True");
        assert_eq!(arr[1]["type"], "Ready");
        assert_eq!(arr[1]["status"], "False");
    }

    #[test]
    fn test_conditions_reject_wrong_shape() {
        let one = serde_json::json!([{"type": "Progressing", "status": "True"}]);
        assert!(serde_json::from_value::<Conditions>(one).is_err());

        let swapped = serde_json::json!([
            {"type": "Ready", "status": "True"},
            {"type": "Progressing", "status": "False"}
        ]);
        assert!(serde_json::from_value::<Conditions>(swapped).is_err());
    }

    #[test]
    fn test_transition_keeps_unchanged_timestamps() {
        let first = Conditions::new(true, false, "Creating");
        let next = Conditions::transition(Some(&first), true, true, "Ready");
        assert_eq!(
            next.progressing().last_transition_time,
            first.progressing().last_transition_time
        );
        assert!(next.is_ready());
    }

    #[test]
    fn test_object_meta_omits_empty_fields() {
        let meta = ObjectMeta::named("default", "vm-a");
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json, serde_json::json!({"name": "vm-a", "namespace": "default"}));
    }

    #[test]
    fn test_object_key_display() {
        assert_eq!(
            ObjectKey::new("VirtualMachine", "default", "vm-a").to_string(),
            "VirtualMachine default/\"vm-a\""
        );
        assert_eq!(
            ObjectKey::new("StorageClass", "", "local").to_string(),
            "StorageClass \"local\""
        );
    }
}
