use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidings_protocol::Event;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::{EventBus, EventHandler, SubscriptionId};
use crate::error::Result;
use crate::filter::{AcceptAll, SharedFilter};
use crate::store::EventStore;

#[derive(Default)]
struct Counters {
    recorded: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStats {
    pub recording: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub recorded: u64,
    pub failures: u64,
}

struct ActiveRecording {
    subscription: SubscriptionId,
    writer: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

/// Bus subscriber that hands events to the writer task in publish order
struct Forwarder {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventHandler for Forwarder {
    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow!("recorder writer has stopped"))
    }
}

/// Event Recorder
///
/// While active, every published event accepted by the recording filter is
/// written to the store. Store writes happen on a dedicated task so the
/// publisher never waits on storage.
pub struct Recorder {
    bus: Arc<EventBus>,
    store: Arc<dyn EventStore>,
    active: Mutex<Option<ActiveRecording>>,
    recording: AtomicBool,
    counters: Arc<Counters>,
}

impl Recorder {
    pub fn new(bus: Arc<EventBus>, store: Arc<dyn EventStore>) -> Self {
        Self {
            bus,
            store,
            active: Mutex::new(None),
            recording: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Start recording events accepted by `filter` (all events if `None`).
    ///
    /// Returns `false` if a recording was already running; its filter is kept.
    pub async fn start(&self, filter: Option<SharedFilter>) -> Result<bool> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            warn!("Recorder already running");
            return Ok(false);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let filter = filter.unwrap_or_else(|| Arc::new(AcceptAll));
        // If subscribing fails the forwarder is dropped and the writer exits
        let writer = tokio::spawn(write_loop(self.store.clone(), rx, self.counters.clone()));
        let subscription = self.bus.subscribe(filter, Arc::new(Forwarder { tx })).await?;

        let started_at = Utc::now();
        *active = Some(ActiveRecording {
            subscription,
            writer,
            started_at,
        });
        self.recording.store(true, Ordering::SeqCst);

        info!(subscription_id = %subscription, "Recording started");
        Ok(true)
    }

    /// Stop recording and wait until every forwarded event has been stored.
    ///
    /// Returns `false` if the recorder was not running.
    pub async fn stop(&self) -> bool {
        let mut active = self.active.lock().await;
        let Some(recording) = active.take() else {
            return false;
        };
        self.recording.store(false, Ordering::SeqCst);

        // Dropping the subscription drops the sender, which ends the writer
        self.bus.unsubscribe(recording.subscription).await;
        if let Err(e) = recording.writer.await {
            error!("Recorder writer task failed: {}", e);
        }

        info!(
            subscription_id = %recording.subscription,
            recorded = self.counters.recorded.load(Ordering::Relaxed),
            "Recording stopped"
        );
        true
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> RecorderStats {
        let active = self.active.lock().await;
        RecorderStats {
            recording: active.is_some(),
            started_at: active.as_ref().map(|a| a.started_at),
            recorded: self.counters.recorded.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

async fn write_loop(
    store: Arc<dyn EventStore>,
    mut rx: mpsc::UnboundedReceiver<Event>,
    counters: Arc<Counters>,
) {
    while let Some(event) = rx.recv().await {
        let event_id = event.id.clone();
        match store.store(event).await {
            Ok(()) => {
                counters.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(event_id = %event_id, "Failed to record event: {}", e);
            }
        }
    }
}
