use std::str::FromStr;

use tidings_protocol::Event;

use super::{Filter, SharedFilter};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

impl FromStr for LogicalOp {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AND" => Ok(LogicalOp::And),
            "OR" => Ok(LogicalOp::Or),
            "NOT" => Ok(LogicalOp::Not),
            _ => Err(EngineError::UnknownFilterType(format!(
                "unsupported composite operator '{}'",
                s
            ))),
        }
    }
}

/// Boolean combination of child filters.
///
/// An empty `And` accepts every event and an empty `Or` accepts none, the
/// identity elements of each operator.
#[derive(Debug, Clone)]
pub enum CompositeFilter {
    And(Vec<SharedFilter>),
    Or(Vec<SharedFilter>),
    Not(SharedFilter),
}

impl CompositeFilter {
    pub fn and(children: Vec<SharedFilter>) -> Self {
        CompositeFilter::And(children)
    }

    pub fn or(children: Vec<SharedFilter>) -> Self {
        CompositeFilter::Or(children)
    }

    pub fn not(child: SharedFilter) -> Self {
        CompositeFilter::Not(child)
    }

    /// Build from an operator and a child list; `Not` takes exactly one child
    pub fn new(op: LogicalOp, mut children: Vec<SharedFilter>) -> Result<Self> {
        match op {
            LogicalOp::And => Ok(CompositeFilter::And(children)),
            LogicalOp::Or => Ok(CompositeFilter::Or(children)),
            LogicalOp::Not => match (children.pop(), children.is_empty()) {
                (Some(child), true) => Ok(CompositeFilter::Not(child)),
                _ => Err(EngineError::InvalidConfiguration(
                    "NOT filter takes exactly one child".to_string(),
                )),
            },
        }
    }
}

impl Filter for CompositeFilter {
    fn accepts(&self, event: &Event) -> bool {
        match self {
            CompositeFilter::And(children) => children.iter().all(|f| f.accepts(event)),
            CompositeFilter::Or(children) => children.iter().any(|f| f.accepts(event)),
            CompositeFilter::Not(child) => !child.accepts(event),
        }
    }
}
