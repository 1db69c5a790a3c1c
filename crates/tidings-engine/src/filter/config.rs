use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidings_protocol::Value;

use super::{
    AgentFilter, CompositeFilter, FieldFilter, PatternFilter, SharedFilter, TimeRangeFilter,
    TypeFilter,
};
use crate::error::{EngineError, Result};

const KNOWN_TYPES: &[&str] = &["pattern", "type", "agent", "time_range", "field", "composite"];

/// Declarative filter description, as received from the script bridge.
///
/// ```json
/// {"type": "composite", "op": "AND", "filters": [
///     {"type": "pattern", "pattern": "agent.*"},
///     {"type": "agent", "agentID": "agent1"}
/// ]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    Pattern {
        pattern: String,
    },
    #[serde(rename = "type")]
    Types {
        types: Vec<String>,
    },
    Agent {
        #[serde(rename = "agentID", default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(rename = "agentIDs", default, skip_serializing_if = "Vec::is_empty")]
        agent_ids: Vec<String>,
    },
    TimeRange {
        #[serde(default)]
        start: Option<DateTime<Utc>>,
        #[serde(default)]
        end: Option<DateTime<Utc>>,
    },
    Field {
        field: String,
        operator: String,
        #[serde(default)]
        value: Value,
    },
    Composite {
        op: String,
        #[serde(default)]
        filters: Vec<FilterConfig>,
    },
}

impl FilterConfig {
    pub fn pattern(pattern: impl Into<String>) -> Self {
        FilterConfig::Pattern {
            pattern: pattern.into(),
        }
    }

    /// Parse a JSON description, reporting an unsupported `type` as
    /// `UnknownFilterType` rather than a generic decode failure.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        check_types(&value)?;
        serde_json::from_value(value)
            .map_err(|e| EngineError::InvalidConfiguration(format!("invalid filter config: {}", e)))
    }

    /// Build the filter this config describes
    pub fn build(&self) -> Result<SharedFilter> {
        let filter: SharedFilter = match self {
            FilterConfig::Pattern { pattern } => Arc::new(PatternFilter::new(pattern)?),
            FilterConfig::Types { types } => Arc::new(TypeFilter::new(types.iter().cloned())),
            FilterConfig::Agent {
                agent_id,
                agent_ids,
            } => {
                let ids = agent_id.iter().chain(agent_ids.iter()).cloned();
                Arc::new(AgentFilter::new(ids))
            }
            FilterConfig::TimeRange { start, end } => Arc::new(TimeRangeFilter::new(*start, *end)?),
            FilterConfig::Field {
                field,
                operator,
                value,
            } => Arc::new(FieldFilter::new(
                field.clone(),
                operator.parse()?,
                value.clone(),
            )),
            FilterConfig::Composite { op, filters } => {
                let children = filters
                    .iter()
                    .map(FilterConfig::build)
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(CompositeFilter::new(op.parse()?, children)?)
            }
        };
        Ok(filter)
    }
}

/// Walk the description and reject unsupported `type` tags, including nested ones
fn check_types(value: &serde_json::Value) -> Result<()> {
    let Some(obj) = value.as_object() else {
        return Err(EngineError::InvalidConfiguration(
            "filter config must be an object".to_string(),
        ));
    };

    match obj.get("type").and_then(|t| t.as_str()) {
        Some(kind) if KNOWN_TYPES.contains(&kind) => {}
        Some(kind) => return Err(EngineError::UnknownFilterType(kind.to_string())),
        None => {
            return Err(EngineError::InvalidConfiguration(
                "filter config is missing 'type'".to_string(),
            ));
        }
    }

    if let Some(children) = obj.get("filters").and_then(|f| f.as_array()) {
        for child in children {
            check_types(child)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidings_protocol::Event;

    #[test]
    fn test_composite_config() {
        let config = FilterConfig::from_json(json!({
            "type": "composite",
            "op": "AND",
            "filters": [
                {"type": "pattern", "pattern": "agent.*"},
                {"type": "agent", "agentID": "agent1"}
            ]
        }))
        .unwrap();
        let filter = config.build().unwrap();

        assert!(filter.accepts(&Event::for_agent("agent.started", "agent1", Value::Null)));
        assert!(!filter.accepts(&Event::for_agent("agent.started", "agent2", Value::Null)));
        assert!(!filter.accepts(&Event::for_agent("tool.called", "agent1", Value::Null)));
    }

    #[test]
    fn test_field_config() {
        let config = FilterConfig::from_json(json!({
            "type": "field",
            "field": "latency_ms",
            "operator": ">=",
            "value": 250
        }))
        .unwrap();
        let filter = config.build().unwrap();

        let slow = Event::new("tool.completed", Value::object([("latency_ms", 300)]));
        let fast = Event::new("tool.completed", Value::object([("latency_ms", 20)]));
        assert!(filter.accepts(&slow));
        assert!(!filter.accepts(&fast));
    }

    #[test]
    fn test_type_config_uses_type_tag() {
        let config = FilterConfig::from_json(json!({
            "type": "type",
            "types": ["agent.started", "agent.stopped"]
        }))
        .unwrap();
        assert_eq!(
            config,
            FilterConfig::Types {
                types: vec!["agent.started".to_string(), "agent.stopped".to_string()]
            }
        );
    }

    #[test]
    fn test_unknown_filter_type() {
        let err = FilterConfig::from_json(json!({"type": "regex", "expr": ".*"})).unwrap_err();
        assert!(matches!(err, EngineError::UnknownFilterType(ref t) if t == "regex"));

        let nested = FilterConfig::from_json(json!({
            "type": "composite",
            "op": "OR",
            "filters": [{"type": "geo"}]
        }))
        .unwrap_err();
        assert!(matches!(nested, EngineError::UnknownFilterType(_)));
    }

    #[test]
    fn test_unknown_operator_fails_at_build() {
        let config = FilterConfig::Composite {
            op: "XOR".to_string(),
            filters: vec![],
        };
        assert!(matches!(
            config.build(),
            Err(EngineError::UnknownFilterType(_))
        ));

        let field = FilterConfig::Field {
            field: "x".to_string(),
            operator: "~".to_string(),
            value: Value::Null,
        };
        assert!(matches!(field.build(), Err(EngineError::UnknownFilterType(_))));
    }

    #[test]
    fn test_invalid_pattern_propagates() {
        let config = FilterConfig::pattern("agent..started");
        assert!(matches!(
            config.build(),
            Err(EngineError::InvalidPattern { .. })
        ));
    }
}
