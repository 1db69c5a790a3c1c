//! Event record and well-known event kinds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

// ============================================================================
// Event Kind Constants
// ============================================================================

/// Event kind constants following the format: `<category>.<action>`
pub struct EventKind;

impl EventKind {
    // Agent lifecycle
    pub const AGENT_STARTED: &str = "agent.started";
    pub const AGENT_STOPPED: &str = "agent.stopped";
    pub const AGENT_OUTPUT: &str = "agent.output";
    pub const AGENT_ERROR: &str = "agent.error";
    pub const AGENT_STATE_CHANGED: &str = "agent.state_changed";

    // Tool calls
    pub const TOOL_CALLED: &str = "tool.called";
    pub const TOOL_COMPLETED: &str = "tool.completed";
    pub const TOOL_FAILED: &str = "tool.failed";

    // Workflow lifecycle
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_STEP_COMPLETED: &str = "workflow.step_completed";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";

    // State changes
    pub const STATE_CHANGED: &str = "state.changed";

    // Metrics
    pub const METRIC_RECORDED: &str = "metrics.recorded";

    /// Prefix for events raised by the script bridge (`bridge.<name>`)
    pub const BRIDGE_PREFIX: &str = "bridge";
}

// ============================================================================
// Event
// ============================================================================

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Core event record.
///
/// `id` and `timestamp` are fixed when the event is built. Once an event has
/// been handed to the bus it is only ever shared, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event id (UUID v4 unless supplied by the producer)
    #[serde(default = "generate_id")]
    pub id: String,

    /// Dot-segmented event type
    /// Examples: "agent.started", "tool.called", "workflow.step_completed"
    #[serde(rename = "type")]
    pub kind: String,

    /// When the event occurred
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Agent that produced the event, if any
    #[serde(rename = "agentID", default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,

    /// Event-specific payload
    #[serde(default)]
    pub data: Value,

    /// Free-form attributes, used by field filters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,

    /// Failure description attached to the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with a generated id and the current time
    pub fn new(kind: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            id: generate_id(),
            kind: kind.into(),
            timestamp: Utc::now(),
            agent_id: None,
            agent_name: None,
            data: data.into(),
            metadata: BTreeMap::new(),
            error: None,
        }
    }

    /// Create an agent-related event
    pub fn for_agent(
        kind: impl Into<String>,
        agent_id: impl Into<String>,
        data: impl Into<Value>,
    ) -> Self {
        Self::new(kind, data).with_agent(agent_id)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_agent_name(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Look up a named field: metadata first, then an object-shaped `data`.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.metadata.get(name).or_else(|| self.data.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kinds_format() {
        assert!(EventKind::AGENT_STARTED.contains('.'));
        assert!(EventKind::TOOL_CALLED.contains('.'));
        assert!(EventKind::WORKFLOW_COMPLETED.contains('.'));
    }

    #[test]
    fn test_deserialize_bridge_event() {
        let json = r#"{
            "type": "test.event",
            "agentID": "agent1",
            "data": {"key": "value"}
        }"#;

        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, "test.event");
        assert_eq!(event.agent_id.as_deref(), Some("agent1"));
        assert_eq!(event.data.get("key").and_then(Value::as_str), Some("value"));
        assert!(!event.id.is_empty());
        assert!(event.metadata.is_empty());
    }

    #[test]
    fn test_serialize_uses_wire_names() {
        let event = Event::for_agent("agent.started", "agent-7", Value::Null)
            .with_agent_name("planner")
            .with_metadata("priority", 3);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent.started");
        assert_eq!(json["agentID"], "agent-7");
        assert_eq!(json["agentName"], "planner");
        assert_eq!(json["metadata"]["priority"], 3.0);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_field_prefers_metadata() {
        let event = Event::new("tool.called", Value::object([("level", 1), ("tool", 2)]))
            .with_metadata("level", "meta");

        assert_eq!(event.field("level"), Some(&Value::from("meta")));
        assert_eq!(event.field("tool"), Some(&Value::from(2)));
        assert_eq!(event.field("missing"), None);
    }
}
