//! Live event streams: bounded queues fed by a bus subscription.
//!
//! A full stream never blocks the bus. The newest event is dropped and
//! counted instead, so one slow consumer cannot stall unrelated subscribers.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tidings_protocol::Event;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{EventBus, EventHandler, SubscriptionId};
use crate::error::{EngineError, Result};
use crate::filter::SharedFilter;

pub const DEFAULT_STREAM_CAPACITY: usize = 100;

/// Log the first dropped event, then every this many
const DROP_LOG_INTERVAL: u64 = 100;

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub delivered: u64,
    pub dropped: u64,
    pub closed: bool,
}

impl Counters {
    fn snapshot(&self) -> StreamStats {
        StreamStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::SeqCst),
        }
    }
}

/// Observer side of a stream, kept by the engine registry
#[derive(Clone)]
pub struct StreamHandle {
    id: String,
    subscription: Option<SubscriptionId>,
    created_at: DateTime<Utc>,
    counters: Arc<Counters>,
}

impl StreamHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) {
        self.counters.closed.store(true, Ordering::SeqCst);
    }
}

struct StreamFeeder {
    stream_id: String,
    tx: mpsc::Sender<Event>,
    counters: Arc<Counters>,
}

impl EventHandler for StreamFeeder {
    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(dropped)) => {
                let total = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total == 1 || total % DROP_LOG_INTERVAL == 0 {
                    warn!(
                        stream_id = %self.stream_id,
                        event_id = %dropped.id,
                        dropped = total,
                        "Stream is full, dropping event"
                    );
                }
            }
            // Consumer went away; the subscription is removed on drop
            Err(TrySendError::Closed(_)) => {}
        }
        Ok(())
    }
}

struct Feed {
    bus: Arc<EventBus>,
    subscription: SubscriptionId,
}

/// Bounded, filtered queue of live events
pub struct EventStream {
    id: String,
    rx: mpsc::Receiver<Event>,
    counters: Arc<Counters>,
    feed: Option<Feed>,
    created_at: DateTime<Utc>,
}

impl EventStream {
    /// Subscribe to `bus` and buffer up to `capacity` accepted events
    pub async fn open(bus: Arc<EventBus>, filter: SharedFilter, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(EngineError::InvalidConfiguration(
                "stream capacity must be positive".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(capacity);
        let id = Uuid::new_v4().to_string();
        let counters = Arc::new(Counters::default());

        let feeder = StreamFeeder {
            stream_id: id.clone(),
            tx,
            counters: counters.clone(),
        };
        let subscription = bus.subscribe(filter, Arc::new(feeder)).await?;
        debug!(stream_id = %id, subscription_id = %subscription, capacity, "Stream opened");

        Ok(Self {
            id,
            rx,
            counters,
            feed: Some(Feed { bus, subscription }),
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            id: self.id.clone(),
            subscription: self.feed.as_ref().map(|f| f.subscription),
            created_at: self.created_at,
            counters: self.counters.clone(),
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }

    /// Wait for the next event. Returns `None` once the stream is closed and
    /// drained.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take a buffered event without waiting
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving new events; already buffered events can still be read
    pub async fn close(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.bus.unsubscribe(feed.subscription).await;
        }
        self.rx.close();
        self.counters.closed.store(true, Ordering::SeqCst);
    }

    /// Derived stream holding only events the predicate accepts
    pub fn filter<P>(self, predicate: P) -> EventStream
    where
        P: Fn(&Event) -> bool + Send + 'static,
    {
        self.pipe(move |event| predicate(&event).then_some(event))
    }

    /// Derived stream with every event transformed
    pub fn map<F>(self, transform: F) -> EventStream
    where
        F: Fn(Event) -> Event + Send + 'static,
    {
        self.pipe(move |event| Some(transform(event)))
    }

    /// Consume the stream until it ends, folding every event into `init`
    pub async fn fold<A, F>(mut self, init: A, mut step: F) -> A
    where
        F: FnMut(A, Event) -> A,
    {
        let mut acc = init;
        while let Some(event) = self.next().await {
            acc = step(acc, event);
        }
        acc
    }

    /// Forward events through `step` into a new bounded stream from a
    /// background task. The task ends when either side closes.
    fn pipe<F>(mut self, mut step: F) -> EventStream
    where
        F: FnMut(Event) -> Option<Event> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.rx.max_capacity());
        let counters = Arc::new(Counters::default());
        let downstream = counters.clone();
        let id = Uuid::new_v4().to_string();
        let upstream_id = self.id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = self.next() => {
                        let Some(event) = next else { break };
                        let Some(out) = step(event) else { continue };
                        if tx.send(out).await.is_err() {
                            break;
                        }
                        downstream.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            downstream.closed.store(true, Ordering::SeqCst);
            debug!(stream_id = %upstream_id, "Derived stream finished");
        });

        EventStream {
            id,
            rx,
            counters,
            feed: None,
            created_at: Utc::now(),
        }
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.counters.closed.store(true, Ordering::SeqCst);
        if let Some(feed) = self.feed.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    feed.bus.unsubscribe(feed.subscription).await;
                });
            }
        }
    }
}
