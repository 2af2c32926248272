//! Rollout stage, persisted in DaemonSet annotations.
//!
//! The coordinator keeps nothing in memory between passes: stage, start
//! time, target hash and the last stage reported stuck all live on the
//! DaemonSet itself.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use virtops_reconcile::{IntOrString, SpecHash};

pub const STAGE_ANNOTATION: &str = "virtops.io/rollout-stage";
pub const STARTED_AT_ANNOTATION: &str = "virtops.io/rollout-started-at";
pub const HASH_ANNOTATION: &str = "virtops.io/rollout-hash";
pub const STUCK_ANNOTATION: &str = "virtops.io/rollout-stuck";

/// `maxUnavailable` outside of a rollout and in the one-at-a-time stages.
pub const STEADY_MAX_UNAVAILABLE: i32 = 1;

/// `maxUnavailable` once the canary is healthy.
pub const WIDENED_MAX_UNAVAILABLE: &str = "10%";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutStage {
    /// One node at a time until the first updated pod is ready.
    Canary,
    /// A percentage of the fleet at a time.
    Widened,
    /// Back to one at a time for the last nodes.
    Narrowed,
}

impl RolloutStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Canary => "Canary",
            Self::Widened => "Widened",
            Self::Narrowed => "Narrowed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Canary" => Some(Self::Canary),
            "Widened" => Some(Self::Widened),
            "Narrowed" => Some(Self::Narrowed),
            _ => None,
        }
    }

    pub fn max_unavailable(&self) -> IntOrString {
        match self {
            Self::Canary | Self::Narrowed => IntOrString::Int(STEADY_MAX_UNAVAILABLE),
            Self::Widened => IntOrString::from(WIDENED_MAX_UNAVAILABLE),
        }
    }
}

impl std::fmt::Display for RolloutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An in-flight rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutState {
    pub stage: RolloutStage,
    /// When the current stage was entered.
    pub started_at: DateTime<Utc>,
    pub hash: SpecHash,
    /// Stage for which a stuck warning was already emitted.
    pub stuck_reported: Option<RolloutStage>,
}

impl RolloutState {
    pub fn begin(hash: SpecHash, now: DateTime<Utc>) -> Self {
        Self {
            stage: RolloutStage::Canary,
            started_at: now,
            hash,
            stuck_reported: None,
        }
    }

    /// Reads the state back; `None` when no rollout is recorded or the
    /// annotations are unreadable.
    pub fn read(annotations: &BTreeMap<String, String>) -> Option<Self> {
        let stage = RolloutStage::parse(annotations.get(STAGE_ANNOTATION)?)?;
        let started_at = DateTime::parse_from_rfc3339(annotations.get(STARTED_AT_ANNOTATION)?)
            .ok()?
            .with_timezone(&Utc);
        let hash = SpecHash::from_raw(annotations.get(HASH_ANNOTATION)?.clone());
        let stuck_reported = annotations
            .get(STUCK_ANNOTATION)
            .and_then(|s| RolloutStage::parse(s));
        Some(Self {
            stage,
            started_at,
            hash,
            stuck_reported,
        })
    }

    pub fn write(&self, annotations: &mut BTreeMap<String, String>) {
        annotations.insert(STAGE_ANNOTATION.to_string(), self.stage.to_string());
        annotations.insert(STARTED_AT_ANNOTATION.to_string(), self.started_at.to_rfc3339());
        annotations.insert(HASH_ANNOTATION.to_string(), self.hash.to_string());
        match self.stuck_reported {
            Some(stage) => {
                annotations.insert(STUCK_ANNOTATION.to_string(), stage.to_string());
            }
            None => {
                annotations.remove(STUCK_ANNOTATION);
            }
        }
    }

    pub fn clear(annotations: &mut BTreeMap<String, String>) {
        for key in [
            STAGE_ANNOTATION,
            STARTED_AT_ANNOTATION,
            HASH_ANNOTATION,
            STUCK_ANNOTATION,
        ] {
            annotations.remove(key);
        }
    }

    /// Moves to `stage` at `now`. The stuck clock and marker belong to the
    /// previous stage.
    pub fn advance(&self, stage: RolloutStage, now: DateTime<Utc>) -> Self {
        Self {
            stage,
            started_at: now,
            stuck_reported: None,
            hash: self.hash.clone(),
        }
    }
}
