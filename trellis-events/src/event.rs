use chrono::{DateTime, Utc};

/// Immutable event record flowing through the bus.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Event {
    /// Dotted type, e.g. `plugin.started`.
    pub event_type: String,
    /// Component name, or `"system"` for runtime-originated events.
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
            correlation_id: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// The predefined event types published by the runtime itself.
pub mod types {
    pub const PLUGIN_LOADED: &str = "plugin.loaded";
    pub const PLUGIN_INITIALIZED: &str = "plugin.initialized";
    pub const PLUGIN_STARTED: &str = "plugin.started";
    pub const PLUGIN_STOPPED: &str = "plugin.stopped";
    pub const PLUGIN_FAILED: &str = "plugin.failed";
    pub const PLUGIN_HEALTH_CHANGED: &str = "plugin.health.changed";

    pub const SYSTEM_STARTED: &str = "system.started";
    pub const SYSTEM_STOPPED: &str = "system.stopped";
    pub const SHUTDOWN_FORCE: &str = "shutdown.force";

    pub const TASK_SCHEDULED: &str = "scheduler.task.scheduled";
    pub const TASK_STARTED: &str = "scheduler.task.started";
    pub const TASK_COMPLETED: &str = "scheduler.task.completed";
    pub const TASK_FAILED: &str = "scheduler.task.failed";
    pub const TASK_CANCELED: &str = "scheduler.task.canceled";
    pub const TASK_OVERRUN: &str = "scheduler.task.overrun";

    pub const BUS_DROP: &str = "bus.drop";
    pub const BUS_HANDLER_ERROR: &str = "bus.handler.error";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_fields() {
        let event = Event::new(types::PLUGIN_STARTED, "cache")
            .with_payload(serde_json::json!({"version": "1.2.0"}))
            .with_correlation_id("req-9");
        assert_eq!(event.event_type, "plugin.started");
        assert_eq!(event.source, "cache");
        assert_eq!(event.payload["version"], "1.2.0");
        assert_eq!(event.correlation_id.as_deref(), Some("req-9"));
    }
}
