mod jsonl;
mod memory;
mod transfer;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidings_protocol::Event;

use crate::error::{EngineError, Result};

pub use jsonl::JsonlEventStore;
pub use memory::{DEFAULT_STORE_CAPACITY, MemoryEventStore};
pub use transfer::{ImportFailure, ImportReport, export_jsonl, import_jsonl};

/// Limit applied when a query does not set one
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Hard cap on the number of events a single query returns
pub const MAX_QUERY_LIMIT: usize = 10_000;

/// Event Store trait for persistence
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event. Insertion order is kept for equal timestamps.
    async fn store(&self, event: Event) -> Result<()>;

    async fn query(&self, query: &EventQuery) -> Result<Vec<Event>>;

    async fn count(&self) -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderBy {
    #[default]
    #[serde(rename = "timestamp")]
    Timestamp,
    #[serde(rename = "type")]
    Type,
    #[serde(rename = "agentID")]
    AgentId,
    #[serde(rename = "id")]
    Id,
}

/// Query over stored events.
///
/// Time bounds are inclusive. `event_types` empty means any type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventQuery {
    pub limit: usize,
    pub offset: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(rename = "agentID")]
    pub agent_id: Option<String>,
    pub event_types: Vec<String>,
    pub order_by: OrderBy,
    pub descending: bool,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
            start_time: None,
            end_time: None,
            agent_id: None,
            event_types: Vec::new(),
            order_by: OrderBy::Timestamp,
            descending: false,
        }
    }
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn ordered_by(mut self, order_by: OrderBy, descending: bool) -> Self {
        self.order_by = order_by;
        self.descending = descending;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(EngineError::InvalidConfiguration(
                "query limit must be positive".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(EngineError::InvalidConfiguration(format!(
                    "query start {} is after end {}",
                    start, end
                )));
            }
        }
        Ok(())
    }

    /// Limit actually applied, after the hard cap
    pub fn effective_limit(&self) -> usize {
        self.limit.min(MAX_QUERY_LIMIT)
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.start_time.is_none_or(|s| event.timestamp >= s)
            && self.end_time.is_none_or(|e| event.timestamp <= e)
            && self
                .agent_id
                .as_ref()
                .is_none_or(|id| event.agent_id.as_ref() == Some(id))
            && (self.event_types.is_empty() || self.event_types.contains(&event.kind))
    }

    fn compare(&self, a: &Event, b: &Event) -> Ordering {
        let ordering = match self.order_by {
            OrderBy::Timestamp => a.timestamp.cmp(&b.timestamp),
            OrderBy::Type => a.kind.cmp(&b.kind),
            OrderBy::AgentId => a.agent_id.cmp(&b.agent_id),
            OrderBy::Id => a.id.cmp(&b.id),
        };
        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }

    /// Run this query over events given in insertion order
    pub(crate) fn execute<'a, I>(&self, events: I) -> Result<Vec<Event>>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        self.validate()?;

        let mut matched: Vec<&Event> = events.into_iter().filter(|e| self.matches(e)).collect();
        // Stable sort, so equal keys stay in insertion order
        matched.sort_by(|a, b| self.compare(a, b));

        Ok(matched
            .into_iter()
            .skip(self.offset)
            .take(self.effective_limit())
            .cloned()
            .collect())
    }
}
