//! Event filter algebra.
//!
//! Every filter answers one question, [`Filter::accepts`], without side
//! effects and without failing: missing fields and type mismatches evaluate
//! to `false`. Construction is where validation happens, so a malformed
//! pattern is rejected up front instead of silently matching nothing.

mod composite;
mod config;
mod field;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tidings_protocol::Event;

use crate::error::{EngineError, Result};

pub use composite::{CompositeFilter, LogicalOp};
pub use config::FilterConfig;
pub use field::{CompareOp, FieldFilter};

/// Predicate over events
pub trait Filter: Send + Sync + fmt::Debug {
    fn accepts(&self, event: &Event) -> bool;
}

pub type SharedFilter = Arc<dyn Filter>;

/// Accepts every event
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Filter for AcceptAll {
    fn accepts(&self, _event: &Event) -> bool {
        true
    }
}

// ============================================================================
// Pattern filter
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
}

/// Glob match over the dot-separated segments of the event type.
///
/// `*` stands for exactly one segment. A final `**` stands for one or more
/// remaining segments, so `agent.**` matches `agent.started` and
/// `agent.tool.called` but not `agent`.
#[derive(Debug, Clone)]
pub struct PatternFilter {
    pattern: String,
    segments: Vec<Segment>,
    open_tail: bool,
}

impl PatternFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.trim().is_empty() {
            return Err(EngineError::invalid_pattern(pattern, "pattern is empty"));
        }

        let parts: Vec<&str> = pattern.split('.').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());
        let mut open_tail = false;

        for (i, part) in parts.iter().enumerate() {
            match *part {
                "" => {
                    return Err(EngineError::invalid_pattern(pattern, "empty segment"));
                }
                "**" if i == last => open_tail = true,
                "**" => {
                    return Err(EngineError::invalid_pattern(
                        pattern,
                        "'**' is only allowed as the last segment",
                    ));
                }
                "*" => segments.push(Segment::Any),
                p if p.contains('*') => {
                    return Err(EngineError::invalid_pattern(
                        pattern,
                        format!("wildcard must fill a whole segment, got '{}'", p),
                    ));
                }
                p => segments.push(Segment::Literal(p.to_string())),
            }
        }

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
            open_tail,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Match a raw event type against this pattern
    pub fn matches(&self, kind: &str) -> bool {
        let mut parts = kind.split('.');

        for segment in &self.segments {
            match (segment, parts.next()) {
                (_, None) => return false,
                (Segment::Any, Some(_)) => {}
                (Segment::Literal(expected), Some(actual)) => {
                    if expected != actual {
                        return false;
                    }
                }
            }
        }

        let has_rest = parts.next().is_some();
        if self.open_tail { has_rest } else { !has_rest }
    }
}

impl Filter for PatternFilter {
    fn accepts(&self, event: &Event) -> bool {
        self.matches(&event.kind)
    }
}

// ============================================================================
// Type / agent / time filters
// ============================================================================

/// Exact match of the event type against an allowed set
#[derive(Debug, Clone)]
pub struct TypeFilter {
    types: HashSet<String>,
}

impl TypeFilter {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
        }
    }
}

impl Filter for TypeFilter {
    fn accepts(&self, event: &Event) -> bool {
        self.types.contains(&event.kind)
    }
}

/// Exact match of the producing agent against an allowed set
#[derive(Debug, Clone)]
pub struct AgentFilter {
    agent_ids: HashSet<String>,
}

impl AgentFilter {
    pub fn new<I, S>(agent_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_ids: agent_ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl Filter for AgentFilter {
    fn accepts(&self, event: &Event) -> bool {
        event
            .agent_id
            .as_ref()
            .is_some_and(|id| self.agent_ids.contains(id))
    }
}

/// Inclusive bounds on the event timestamp
#[derive(Debug, Clone)]
pub struct TimeRangeFilter {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl TimeRangeFilter {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<Self> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(EngineError::InvalidConfiguration(format!(
                    "time range start {} is after end {}",
                    s, e
                )));
            }
        }
        Ok(Self { start, end })
    }
}

impl Filter for TimeRangeFilter {
    fn accepts(&self, event: &Event) -> bool {
        self.start.is_none_or(|s| event.timestamp >= s)
            && self.end.is_none_or(|e| event.timestamp <= e)
    }
}
