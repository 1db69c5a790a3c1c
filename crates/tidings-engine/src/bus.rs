//! In-process publish/subscribe bus.
//!
//! Publishing is synchronous with respect to handlers: by the time
//! [`EventBus::publish`] returns, every matching handler has run. Handlers are
//! plain callbacks; one that needs to do async work hands it off to a task or
//! channel (see the recorder and live streams).

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidings_protocol::Event;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::filter::{PatternFilter, SharedFilter};

/// Identifier of a bus subscription, unique for the life of the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Callback invoked for every accepted event
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self(event)
    }
}

struct Subscription {
    id: SubscriptionId,
    filter: SharedFilter,
    handler: Arc<dyn EventHandler>,
    active: AtomicBool,
    delivered: AtomicU64,
    created_at: DateTime<Utc>,
}

/// Point-in-time view of one subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub active: bool,
    pub delivered: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub handler_failures: u64,
    pub subscriptions: usize,
    pub active_subscriptions: usize,
    pub closed: bool,
}

pub struct EventBus {
    /// Kept in registration order, which is also dispatch order
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
    failures: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Register a handler for every event the filter accepts
    pub async fn subscribe(
        &self,
        filter: SharedFilter,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        let mut subscriptions = self.subscriptions.write().await;
        // Checked under the write lock so a concurrent close cannot miss this entry
        if self.is_closed() {
            return Err(EngineError::BusClosed);
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        subscriptions.push(Arc::new(Subscription {
            id,
            filter,
            handler,
            active: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
            created_at: Utc::now(),
        }));

        debug!(subscription_id = %id, "Subscription registered");
        Ok(id)
    }

    /// Subscribe with a type pattern such as `agent.*`
    pub async fn subscribe_pattern(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        let filter: SharedFilter = Arc::new(PatternFilter::new(pattern)?);
        self.subscribe(filter, handler).await
    }

    /// Remove a subscription. Unknown ids are ignored; returns whether
    /// anything was removed.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        let removed = subscriptions.len() != before;
        if removed {
            debug!(subscription_id = %id, "Subscription removed");
        }
        removed
    }

    /// Stop delivering to a subscription while keeping it registered
    pub async fn pause_subscription(&self, id: SubscriptionId) -> Result<()> {
        self.set_active(id, false).await
    }

    pub async fn resume_subscription(&self, id: SubscriptionId) -> Result<()> {
        self.set_active(id, true).await
    }

    async fn set_active(&self, id: SubscriptionId, active: bool) -> Result<()> {
        let subscriptions = self.subscriptions.read().await;
        let subscription = subscriptions
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("subscription {}", id)))?;
        subscription.active.store(active, Ordering::SeqCst);
        Ok(())
    }

    /// Deliver an event to every active subscription whose filter accepts it.
    ///
    /// Returns the number of handlers invoked. Handler errors and panics are
    /// logged and counted, never returned.
    pub async fn publish(&self, event: &Event) -> Result<usize> {
        if self.is_closed() {
            return Err(EngineError::BusClosed);
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot, then release the lock before running any handler
        let targets: Vec<Arc<Subscription>> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|s| s.active.load(Ordering::SeqCst) && s.filter.accepts(event))
                .cloned()
                .collect()
        };

        for subscription in &targets {
            subscription.delivered.fetch_add(1, Ordering::Relaxed);
            self.delivered.fetch_add(1, Ordering::Relaxed);

            let outcome = catch_unwind(AssertUnwindSafe(|| subscription.handler.handle(event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription_id = %subscription.id,
                        event_id = %event.id,
                        event_type = %event.kind,
                        "Event handler failed: {:#}", e
                    );
                }
                Err(panic) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription_id = %subscription.id,
                        event_id = %event.id,
                        event_type = %event.kind,
                        "Event handler panicked: {}",
                        panic_message(&*panic)
                    );
                }
            }
        }

        Ok(targets.len())
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .read()
            .await
            .iter()
            .map(|s| SubscriptionInfo {
                id: s.id,
                active: s.active.load(Ordering::SeqCst),
                delivered: s.delivered.load(Ordering::Relaxed),
                created_at: s.created_at,
            })
            .collect()
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn stats(&self) -> BusStats {
        let subscriptions = self.subscriptions.read().await;
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_failures: self.failures.load(Ordering::Relaxed),
            subscriptions: subscriptions.len(),
            active_subscriptions: subscriptions
                .iter()
                .filter(|s| s.active.load(Ordering::SeqCst))
                .count(),
            closed: self.is_closed(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop all subscriptions and reject further publishes. Safe to call twice.
    pub async fn close(&self) {
        let mut subscriptions = self.subscriptions.write().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = subscriptions.len();
        subscriptions.clear();
        debug!(dropped, "Event bus closed");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
