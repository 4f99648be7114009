//! Event sink trait and implementations.
//!
//! Sinks receive run and step lifecycle events for observability. Emission
//! through `try_emit` never fails the caller.

use async_trait::async_trait;
use tracing::{debug, info, Level};

/// Run and step lifecycle event types.
pub mod event_types {
    /// A run started executing.
    pub const RUN_STARTED: &str = "run.started";
    /// A run completed successfully.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// A run failed terminally.
    pub const RUN_FAILED: &str = "run.failed";
    /// A run was cancelled.
    pub const RUN_CANCELLED: &str = "run.cancelled";
    /// A run suspended at the approval gate.
    pub const RUN_PAUSED: &str = "run.paused_for_approval";
    /// A step attempt started.
    pub const STEP_STARTED: &str = "step.started";
    /// A step attempt succeeded.
    pub const STEP_SUCCEEDED: &str = "step.succeeded";
    /// A step result was served from a prior succeeded attempt.
    pub const STEP_SHORT_CIRCUITED: &str = "step.short_circuited";
    /// A step attempt failed and will be retried.
    pub const STEP_RETRYING: &str = "step.retrying";
    /// A step reached its terminal failed state.
    pub const STEP_FAILED: &str = "step.failed";
    /// A fan-out group started.
    pub const GROUP_STARTED: &str = "group.started";
    /// A fan-out group converged successfully.
    pub const GROUP_COMPLETED: &str = "group.completed";
    /// A fan-out group failed.
    pub const GROUP_FAILED: &str = "group.failed";
    /// An approval decision was recorded.
    pub const APPROVAL_RECORDED: &str = "approval.recorded";
}

/// Trait for event sinks that can receive events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits an event without blocking; errors are logged, never raised.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// A no-op sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// A sink that logs events through the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: &Option<serde_json::Value>) {
        if self.level == Level::DEBUG {
            debug!(
                event_type = %event_type,
                event_data = ?data,
                "Event: {}", event_type
            );
        } else {
            info!(
                event_type = %event_type,
                event_data = ?data,
                "Event: {}", event_type
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, &data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, &data);
    }
}

/// A collecting sink for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events whose type starts with a prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<serde_json::Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.emit(event_types::RUN_STARTED, None).await;
        sink.try_emit(event_types::RUN_COMPLETED, Some(serde_json::json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_logging_sink() {
        let sink = LoggingEventSink::default();
        sink.emit(event_types::STEP_STARTED, Some(serde_json::json!({"step": "a"})))
            .await;
        sink.try_emit(event_types::STEP_SUCCEEDED, None);
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(event_types::STEP_STARTED, None).await;
        sink.try_emit(event_types::STEP_RETRYING, Some(serde_json::json!({"attempt": 2})));

        assert_eq!(sink.len(), 2);
        let events = sink.events();
        assert_eq!(events[0].0, "step.started");
        assert_eq!(events[1].0, "step.retrying");
    }

    #[tokio::test]
    async fn test_collecting_sink_filter() {
        let sink = CollectingEventSink::new();
        sink.emit(event_types::STEP_STARTED, None).await;
        sink.emit(event_types::STEP_SUCCEEDED, None).await;
        sink.emit(event_types::RUN_COMPLETED, None).await;

        assert_eq!(sink.events_of_type("step.").len(), 2);
        assert_eq!(sink.events_of_type("run.").len(), 1);
    }
}
