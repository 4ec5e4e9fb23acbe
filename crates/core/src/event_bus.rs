//! Materialization event bus: trait for emitting lifecycle events from the
//! catalog, scheduler and executor.
//!
//! Components accept an `Arc<dyn EventSink>`; production wiring can forward
//! events to an audit log or a message bus, tests use [`CaptureSink`].

use crate::types::RuleId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RuleCreated,
    RuleUpdated,
    RuleDeleted,
    RunTriggered,
    RunStarted,
    RunSucceeded,
    RunFailed,
    MetadataUpdateFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializationEvent {
    pub event_id: Uuid,
    pub kind: EventKind,
    pub rule_id: RuleId,
    pub row_count: Option<u64>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting materialization events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MaterializationEvent);
}

/// No-op sink for components that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: MaterializationEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<MaterializationEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<MaterializationEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn count_for(&self, rule_id: RuleId, kind: EventKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.rule_id == rule_id && e.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: MaterializationEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating a `MaterializationEvent`.
pub fn make_event(kind: EventKind, rule_id: RuleId) -> MaterializationEvent {
    MaterializationEvent {
        event_id: Uuid::new_v4(),
        kind,
        rule_id,
        row_count: None,
        error: None,
        timestamp: Utc::now(),
    }
}

impl MaterializationEvent {
    pub fn with_rows(mut self, rows: u64) -> Self {
        self.row_count = Some(rows);
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Convenience: create a no-op event bus.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        sink.emit(make_event(EventKind::RunStarted, RuleId(1)));
        sink.emit(make_event(EventKind::RunSucceeded, RuleId(1)).with_rows(42));
        sink.emit(make_event(EventKind::RunFailed, RuleId(2)).with_error("boom"));

        assert_eq!(sink.count(), 3);
        assert_eq!(sink.count_kind(EventKind::RunStarted), 1);
        assert_eq!(sink.count_for(RuleId(2), EventKind::RunFailed), 1);

        let events = sink.events();
        assert_eq!(events[1].row_count, Some(42));
        assert_eq!(events[2].error.as_deref(), Some("boom"));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(EventKind::RuleCreated, RuleId(1)));
    }
}
