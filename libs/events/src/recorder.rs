//! Event recorders.
//!
//! Controllers hold an `Arc<dyn EventRecorder>`; the in-memory recorder is
//! what the binary and the tests use.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{info, warn};
use virtops_id::EventId;

use crate::{Event, EventType, ObjectReference};

/// Sink for controller events.
pub trait EventRecorder: Send + Sync {
    /// Record a fully built event.
    fn record(&self, event: Event);

    /// Build and record a Normal event.
    fn normal(&self, object: &ObjectReference, reason: &str, message: &str) {
        self.emit(object, EventType::Normal, reason, message);
    }

    /// Build and record a Warning event.
    fn warning(&self, object: &ObjectReference, reason: &str, message: &str) {
        self.emit(object, EventType::Warning, reason, message);
    }

    fn emit(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        let builder = Event::builder().object(object.clone()).message(message);
        let builder = match event_type {
            EventType::Normal => builder.normal(reason),
            EventType::Warning => builder.warning(reason),
        };
        match builder.build() {
            Ok(event) => self.record(event),
            Err(e) => warn!(error = %e, object = %object, "Dropping malformed event"),
        }
    }
}

/// Distinct events a recorder keeps by default.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

type AggregationKey = (ObjectReference, EventType, String, String);

#[derive(Debug, Default)]
struct RecorderState {
    next_id: i64,
    /// Ids are consecutive from front to back.
    events: VecDeque<Event>,
    index: HashMap<AggregationKey, EventId>,
}

impl RecorderState {
    fn position(&self, id: EventId) -> Option<usize> {
        let front = self.events.front()?.id.value();
        usize::try_from(id.value() - front).ok()
    }
}

/// In-memory recorder that aggregates repeated events.
///
/// At most `capacity` distinct events are kept; the oldest go first, so the
/// recorder stays bounded however many objects come and go.
#[derive(Debug)]
pub struct MemoryRecorder {
    state: Mutex<RecorderState>,
    capacity: usize,
}

impl Default for MemoryRecorder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RecorderState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Snapshot of all recorded events in first-seen order.
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.iter().cloned().collect()
    }

    /// Events about one object.
    pub fn events_for(&self, object: &ObjectReference) -> Vec<Event> {
        self.lock()
            .events
            .iter()
            .filter(|e| {
                e.involved_object.kind == object.kind
                    && e.involved_object.namespace == object.namespace
                    && e.involved_object.name == object.name
            })
            .cloned()
            .collect()
    }

    /// True if any event about `object` carries `reason`.
    pub fn has_reason(&self, object: &ObjectReference, reason: &str) -> bool {
        self.events_for(object).iter().any(|e| e.reason == reason)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        // A poisoned recorder still holds valid events.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, mut event: Event) {
        match event.event_type {
            EventType::Normal => info!(
                object = %event.involved_object,
                reason = %event.reason,
                message = %event.message,
                "Event"
            ),
            EventType::Warning => warn!(
                object = %event.involved_object,
                reason = %event.reason,
                message = %event.message,
                "Event"
            ),
        }

        let mut state = self.lock();
        let key = event.aggregation_key();
        if let Some(pos) = state.index.get(&key).and_then(|&id| state.position(id)) {
            if let Some(existing) = state.events.get_mut(pos) {
                existing.count += 1;
                existing.last_timestamp = Utc::now();
                return;
            }
        }

        while state.events.len() >= self.capacity {
            let Some(oldest) = state.events.pop_front() else {
                break;
            };
            state.index.remove(&oldest.aggregation_key());
        }

        state.next_id += 1;
        event.id = EventId::new(state.next_id);
        state.index.insert(key, event.id);
        state.events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasons;

    fn vm_ref(name: &str) -> ObjectReference {
        ObjectReference::new("VirtualMachine", "default", name)
    }

    #[test]
    fn test_repeated_events_aggregate() {
        let recorder = MemoryRecorder::new();
        let obj = vm_ref("vm-a");

        for _ in 0..3 {
            recorder.normal(&obj, reasons::SOURCE_DOES_NOT_EXIST, "missing");
        }

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].count, 3);
        assert_eq!(events[0].id, EventId::new(1));
    }

    #[test]
    fn test_distinct_messages_are_separate() {
        let recorder = MemoryRecorder::new();
        let obj = vm_ref("vm-a");
        recorder.normal(&obj, reasons::SNAPSHOT_CREATED, "one");
        recorder.normal(&obj, reasons::SNAPSHOT_CREATED, "two");
        recorder.warning(&vm_ref("vm-b"), reasons::ROLLOUT_STUCK, "two");

        assert_eq!(recorder.events().len(), 3);
        assert_eq!(recorder.events_for(&obj).len(), 2);
        assert!(recorder.has_reason(&vm_ref("vm-b"), reasons::ROLLOUT_STUCK));
        assert!(!recorder.has_reason(&obj, reasons::ROLLOUT_STUCK));
    }

    #[test]
    fn test_capacity_evicts_oldest_events() {
        let recorder = MemoryRecorder::with_capacity(2);
        recorder.normal(&vm_ref("vm-a"), reasons::SNAPSHOT_CREATED, "a");
        recorder.normal(&vm_ref("vm-b"), reasons::SNAPSHOT_CREATED, "b");
        recorder.normal(&vm_ref("vm-b"), reasons::SNAPSHOT_CREATED, "b");
        recorder.normal(&vm_ref("vm-c"), reasons::SNAPSHOT_CREATED, "c");

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert!(recorder.events_for(&vm_ref("vm-a")).is_empty());
        assert_eq!(recorder.events_for(&vm_ref("vm-b"))[0].count, 2);

        // Aggregation still finds survivors after eviction shifted them.
        recorder.normal(&vm_ref("vm-c"), reasons::SNAPSHOT_CREATED, "c");
        assert_eq!(recorder.events_for(&vm_ref("vm-c"))[0].count, 2);
        assert_eq!(recorder.events().len(), 2);
    }

    #[test]
    fn test_malformed_reason_is_dropped() {
        let recorder = MemoryRecorder::new();
        recorder.normal(&vm_ref("vm-a"), "not camel", "x");
        assert!(recorder.events().is_empty());
    }
}
