//! Event record and builder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use virtops_id::{EventId, Uid};

use crate::EventError;

/// Event reasons emitted by the controllers.
pub mod reasons {
    // Clone
    pub const SOURCE_DOES_NOT_EXIST: &str = "SourceDoesNotExist";
    pub const SNAPSHOT_CREATED: &str = "SnapshotCreated";
    pub const SNAPSHOT_READY: &str = "SnapshotReady";
    pub const RESTORE_CREATED: &str = "RestoreCreated";
    pub const RESTORE_READY: &str = "RestoreReady";
    pub const TARGET_ALREADY_EXISTS: &str = "TargetAlreadyExists";
    pub const CLONE_SUCCEEDED: &str = "CloneSucceeded";
    pub const CLONE_FAILED: &str = "CloneFailed";
    pub const TARGET_VM_CREATED: &str = "TargetVMCreated";
    pub const PVC_BOUND: &str = "PVCBound";
    pub const SNAPSHOT_DELETED: &str = "SnapshotDeleted";
    pub const SNAPSHOT_CONTENT_INVALID: &str = "SnapshotContentInvalid";
    pub const RESTORE_FAILED: &str = "RestoreFailed";

    // Snapshot / restore
    pub const SNAPSHOT_CONTENT_CREATED: &str = "SnapshotContentCreated";
    pub const VOLUME_SNAPSHOT_FAILED: &str = "VolumeSnapshotFailed";
    pub const VM_RESTORED: &str = "VirtualMachineRestored";
    pub const RESTORE_WAITING_FOR_STOP: &str = "RestoreWaitingForStop";
    pub const DATA_VOLUME_DELETED: &str = "DataVolumeDeleted";

    // Rollout
    pub const ROLLOUT_STARTED: &str = "RolloutStarted";
    pub const ROLLOUT_WIDENED: &str = "RolloutWidened";
    pub const ROLLOUT_NARROWED: &str = "RolloutNarrowed";
    pub const ROLLOUT_COMPLETE: &str = "RolloutComplete";
    pub const ROLLOUT_STUCK: &str = "RolloutStuck";
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EventType {
    #[default]
    Normal,
    Warning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// Reference to the object an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,
}

impl ObjectReference {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }
}

impl std::fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Sequence number assigned by the recorder.
    pub id: EventId,

    pub involved_object: ObjectReference,

    #[serde(rename = "type")]
    pub event_type: EventType,

    /// CamelCase machine-readable reason, e.g. `SourceDoesNotExist`.
    pub reason: String,

    /// Human-readable message.
    pub message: String,

    /// Number of times this (object, type, reason, message) was seen.
    pub count: u32,

    /// Component that emitted the event.
    pub source: String,

    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates a new event builder.
    pub fn builder() -> EventBuilder {
        EventBuilder::default()
    }

    /// Key used to aggregate repeats of the same event.
    pub fn aggregation_key(&self) -> (ObjectReference, EventType, String, String) {
        (
            self.involved_object.clone(),
            self.event_type,
            self.reason.clone(),
            self.message.clone(),
        )
    }
}

/// Builder for constructing events.
#[derive(Debug, Default)]
pub struct EventBuilder {
    involved_object: Option<ObjectReference>,
    event_type: EventType,
    reason: Option<String>,
    message: String,
    source: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl EventBuilder {
    pub fn object(mut self, object: ObjectReference) -> Self {
        self.involved_object = Some(object);
        self
    }

    pub fn normal(mut self, reason: impl Into<String>) -> Self {
        self.event_type = EventType::Normal;
        self.reason = Some(reason.into());
        self
    }

    pub fn warning(mut self, reason: impl Into<String>) -> Self {
        self.event_type = EventType::Warning;
        self.reason = Some(reason.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Builds the event. The recorder assigns the final `id`.
    pub fn build(self) -> Result<Event, EventError> {
        let involved_object = self
            .involved_object
            .ok_or(EventError::MissingField("involved_object"))?;
        let reason = self.reason.ok_or(EventError::MissingField("reason"))?;
        if !is_camel_case(&reason) {
            return Err(EventError::InvalidReason(reason));
        }
        let ts = self.timestamp.unwrap_or_else(Utc::now);

        Ok(Event {
            id: EventId::default(),
            involved_object,
            event_type: self.event_type,
            reason,
            message: self.message,
            count: 1,
            source: self.source.unwrap_or_else(|| "virtops-controller".to_string()),
            first_timestamp: ts,
            last_timestamp: ts,
        })
    }
}

fn is_camel_case(reason: &str) -> bool {
    let mut chars = reason.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric())
}
