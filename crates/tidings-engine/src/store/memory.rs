use std::collections::VecDeque;

use async_trait::async_trait;
use tidings_protocol::Event;
use tokio::sync::RwLock;

use super::{EventQuery, EventStore};
use crate::error::Result;

/// Default number of events kept before the oldest are evicted
pub const DEFAULT_STORE_CAPACITY: usize = 10_000;

/// In-memory event log with optional retention
pub struct MemoryEventStore {
    events: RwLock<VecDeque<Event>>,
    capacity: Option<usize>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STORE_CAPACITY)
    }

    /// Keep at most `capacity` events, evicting the oldest first
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            capacity: Some(capacity.max(1)),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            capacity: None,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn store(&self, event: Event) -> Result<()> {
        let mut events = self.events.write().await;
        events.push_back(event);
        if let Some(capacity) = self.capacity {
            while events.len() > capacity {
                events.pop_front();
            }
        }
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let events = self.events.read().await;
        query.execute(events.iter())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.events.read().await.len())
    }

    async fn clear(&self) -> Result<()> {
        self.events.write().await.clear();
        Ok(())
    }
}
