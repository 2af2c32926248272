//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing level-triggered
//! reconcilers that converge observed state to desired state. Key concepts:
//!
//! - **Desired state**: What the object's spec asks for.
//! - **Observed state**: What the store currently holds.
//! - **Action**: What the worker should do after a pass (requeue, or wait
//!   for the next periodic pass).
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - Reconcilers keep no sequencing state in memory; anything that must
//!   survive a pass is persisted on the object

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// An IntOrString value could not be interpreted.
    #[error("invalid value {0:?}: expected an integer or a percentage like \"10%\"")]
    InvalidIntOrString(String),
}

/// What the worker should do with an object after a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Reconcile this object again after the given delay.
    Requeue(Duration),

    /// Nothing to do until the object (or something it watches) changes;
    /// the periodic pass will pick it up.
    AwaitChange,
}

/// Whether a workload has reached its desired template everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    Converged,
    Converging,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// A spec hash for deterministic comparison.
///
/// Used to detect when a pod template has changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(hex::encode(&result[..8]))
    }

    /// Wrap an already computed hash (e.g. read back from a label).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Classify items by whether their spec hash matches the desired one.
///
/// Returns `(matching, old)`.
pub fn classify_by_hash<I, F>(
    items: I,
    desired: &SpecHash,
    get_hash: F,
) -> (Vec<I::Item>, Vec<I::Item>)
where
    I: IntoIterator,
    F: Fn(&I::Item) -> Option<&SpecHash>,
{
    let mut matching = Vec::new();
    let mut old = Vec::new();

    for item in items {
        if get_hash(&item) == Some(desired) {
            matching.push(item);
        } else {
            old.push(item);
        }
    }

    (matching, old)
}

/// An integer or a percentage string, as used by `maxUnavailable`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrString {
    Int(i32),
    String(String),
}

impl IntOrString {
    /// Resolve against `total`. Percentages round up when `round_up`.
    pub fn scaled_value(&self, total: i32, round_up: bool) -> Result<i32, ReconcileError> {
        match self {
            Self::Int(v) => Ok(*v),
            Self::String(s) => {
                let pct: i64 = s
                    .strip_suffix('%')
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| ReconcileError::InvalidIntOrString(s.clone()))?;
                let scaled = pct * i64::from(total);
                let value = if round_up {
                    (scaled + 99).div_euclid(100)
                } else {
                    scaled.div_euclid(100)
                };
                i32::try_from(value).map_err(|_| ReconcileError::InvalidIntOrString(s.clone()))
            }
        }
    }
}

impl std::fmt::Display for IntOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i32> for IntOrString {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for IntOrString {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// Replacement order for rolling updates; lower values go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReplacementPriority {
    /// Replacing it costs no availability.
    NotReady = 0,
    Ready = 1,
}

/// Order items for replacement, stable within a priority class.
pub fn select_for_replacement<T, F>(items: Vec<T>, get_priority: F) -> Vec<T>
where
    F: Fn(&T) -> ReplacementPriority,
{
    let mut with_priority: Vec<_> = items
        .into_iter()
        .map(|i| {
            let p = get_priority(&i);
            (p, i)
        })
        .collect();

    with_priority.sort_by_key(|(p, _)| *p);
    with_priority.into_iter().map(|(_, i)| i).collect()
}

/// Per-key exponential backoff for requeues.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: BTreeMap<String, u32>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: BTreeMap::new(),
        }
    }

    /// Delay before the next attempt for `key`, doubling per call up to `max`.
    pub fn next_delay(&mut self, key: &str) -> Duration {
        let attempt = self.attempts.entry(key.to_string()).or_insert(0);
        let factor = 1u32.checked_shl(*attempt).unwrap_or(u32::MAX);
        *attempt = attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Forget the backoff state for `key` (on progress).
    pub fn reset(&mut self, key: &str) {
        self.attempts.remove(key);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX)
    }
}

/// Next-due times per object for a periodic reconcile pass.
///
/// Keys without an entry are always due; `AwaitChange` clears the entry so
/// the object is visited on every pass.
#[derive(Debug, Clone, Default)]
pub struct RequeueSchedule {
    due: BTreeMap<String, Instant>,
}

impl RequeueSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_due(&self, key: &str, now: Instant) -> bool {
        self.due.get(key).is_none_or(|at| *at <= now)
    }

    /// Records the outcome of reconciling `key` at `now`.
    pub fn schedule(&mut self, key: &str, action: Action, now: Instant) {
        match action {
            Action::Requeue(after) => {
                self.due.insert(key.to_string(), now + after);
            }
            Action::AwaitChange => {
                self.due.remove(key);
            }
        }
    }

    /// Drops keys that no longer exist.
    pub fn retain_keys<'a, I>(&mut self, live: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let live: std::collections::BTreeSet<&str> = live.into_iter().collect();
        self.due.retain(|k, _| live.contains(k.as_str()));
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }
}

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default retry limit per object.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes

/// Default first backoff step.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Default backoff ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
