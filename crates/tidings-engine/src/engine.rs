//! Engine facade owning one bus, store, recorder, replayer and the
//! filter, aggregator, stream and codec registries.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidings_protocol::{Event, EventKind, Value};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::aggregator::{AggregateSnapshot, Aggregator, AggregatorConfig};
use crate::bus::{BusStats, EventBus, EventHandler, SubscriptionId, SubscriptionInfo};
use crate::clock::{Clock, SystemClock};
use crate::codec::{CodecRegistry, EventCodec};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::filter::{AcceptAll, FilterConfig, SharedFilter, TypeFilter};
use crate::recorder::{Recorder, RecorderStats};
use crate::replay::{ReplayOptions, ReplayStatus, Replayer};
use crate::store::{
    EventQuery, EventStore, ImportReport, MemoryEventStore, export_jsonl, import_jsonl,
};
use crate::stream::{EventStream, StreamHandle, StreamStats};

struct AggregatorEntry {
    aggregator: Arc<Aggregator>,
    subscription: SubscriptionId,
}

struct FilterEntry {
    config: FilterConfig,
    filter: SharedFilter,
    created_at: DateTime<Utc>,
}

/// A filter registered with [`Engine::create_filter`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterInfo {
    pub id: String,
    pub config: FilterConfig,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: StreamStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub events: usize,
    pub recorder: RecorderStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub storage: StorageStats,
    pub bus: BusStats,
    pub filters: usize,
    pub aggregators: usize,
    pub streams: usize,
    pub replay_sessions: usize,
    pub active_replays: usize,
}

pub struct Engine {
    config: EngineConfig,
    bus: Arc<EventBus>,
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    recorder: Recorder,
    replayer: Replayer,
    codecs: CodecRegistry,
    filters: RwLock<HashMap<String, FilterEntry>>,
    aggregators: RwLock<HashMap<String, AggregatorEntry>>,
    streams: RwLock<HashMap<String, StreamHandle>>,
}

impl Engine {
    /// Engine with an in-memory store sized by `config`
    pub fn new(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(MemoryEventStore::with_capacity(config.store_capacity));
        Self::with_parts(config, store, Arc::new(SystemClock))
    }

    pub fn with_store(config: EngineConfig, store: Arc<dyn EventStore>) -> Result<Self> {
        Self::with_parts(config, store, Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let bus = Arc::new(EventBus::new());

        Ok(Self {
            recorder: Recorder::new(bus.clone(), store.clone()),
            replayer: Replayer::new(bus.clone(), store.clone()),
            codecs: CodecRegistry::new(),
            filters: RwLock::new(HashMap::new()),
            aggregators: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            config,
            bus,
            store,
            clock,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    // ========================================================================
    // Publish / subscribe
    // ========================================================================

    pub async fn publish(&self, event: &Event) -> Result<usize> {
        self.bus.publish(event).await
    }

    /// Publish a `bridge.<name>` event carrying `data`
    pub async fn publish_bridge_event(&self, name: &str, data: impl Into<Value>) -> Result<Event> {
        let event = Event::new(bridge_kind(name)?, data).with_metadata("source", "bridge");
        self.bus.publish(&event).await?;
        Ok(event)
    }

    /// Subscribe to `bridge.<name>` events only
    pub async fn on_bridge_event(
        &self,
        name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        let filter = Arc::new(TypeFilter::new([bridge_kind(name)?]));
        self.bus.subscribe(filter, handler).await
    }

    pub async fn subscribe(
        &self,
        filter: SharedFilter,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        self.bus.subscribe(filter, handler).await
    }

    pub async fn subscribe_pattern(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        self.bus.subscribe_pattern(pattern, handler).await
    }

    pub async fn subscribe_with_filter(
        &self,
        filter: &FilterConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        self.bus.subscribe(filter.build()?, handler).await
    }

    /// Subscribe through a filter previously registered with `create_filter`
    pub async fn subscribe_registered(
        &self,
        filter_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        let filter = self.registered_filter(filter_id).await?;
        self.bus.subscribe(filter, handler).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id).await
    }

    pub async fn pause_subscription(&self, id: SubscriptionId) -> Result<()> {
        self.bus.pause_subscription(id).await
    }

    pub async fn resume_subscription(&self, id: SubscriptionId) -> Result<()> {
        self.bus.resume_subscription(id).await
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.bus.subscriptions().await
    }

    // ========================================================================
    // Storage
    // ========================================================================

    /// Write an event straight to the store without publishing it
    pub async fn store_event(&self, event: Event) -> Result<()> {
        self.store.store(event).await
    }

    pub async fn query(&self, query: &EventQuery) -> Result<Vec<Event>> {
        self.store.query(query).await
    }

    /// Query preset with the configured default limit
    pub fn new_query(&self) -> EventQuery {
        EventQuery::new().with_limit(self.config.default_query_limit)
    }

    pub async fn export_store<W>(&self, writer: &mut W) -> Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        export_jsonl(self.store.as_ref(), writer).await
    }

    pub async fn import_store<R>(&self, reader: R) -> Result<ImportReport>
    where
        R: AsyncBufRead + Unpin,
    {
        import_jsonl(self.store.as_ref(), reader).await
    }

    // ========================================================================
    // Live streams
    // ========================================================================

    pub async fn create_stream(&self, filter: SharedFilter) -> Result<EventStream> {
        let stream =
            EventStream::open(self.bus.clone(), filter, self.config.stream_capacity).await?;
        let handle = stream.handle();

        let mut streams = self.streams.write().await;
        streams.retain(|_, h| !h.is_closed());
        streams.insert(handle.id().to_string(), handle);
        Ok(stream)
    }

    pub async fn create_stream_with_filter(&self, filter: Option<&FilterConfig>) -> Result<EventStream> {
        let filter: SharedFilter = match filter {
            Some(config) => config.build()?,
            None => Arc::new(AcceptAll),
        };
        self.create_stream(filter).await
    }

    pub async fn create_stream_registered(&self, filter_id: &str) -> Result<EventStream> {
        let filter = self.registered_filter(filter_id).await?;
        self.create_stream(filter).await
    }

    /// Detach a stream from the bus. Its consumer still drains buffered
    /// events, then sees the end of the stream.
    pub async fn stop_stream(&self, id: &str) -> Result<()> {
        let handle = self
            .streams
            .write()
            .await
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(format!("stream {}", id)))?;

        if let Some(subscription) = handle.subscription() {
            self.bus.unsubscribe(subscription).await;
        }
        handle.mark_closed();
        debug!(stream_id = %id, "Stream stopped");
        Ok(())
    }

    pub async fn streams(&self) -> Vec<StreamInfo> {
        let mut streams: Vec<StreamInfo> = self
            .streams
            .read()
            .await
            .values()
            .filter(|h| !h.is_closed())
            .map(|h| StreamInfo {
                id: h.id().to_string(),
                created_at: h.created_at(),
                stats: h.stats(),
            })
            .collect();
        streams.sort_by_key(|s| s.created_at);
        streams
    }

    // ========================================================================
    // Recording and replay
    // ========================================================================

    pub async fn start_recording(&self, filter: Option<SharedFilter>) -> Result<bool> {
        self.recorder.start(filter).await
    }

    pub async fn stop_recording(&self) -> bool {
        self.recorder.stop().await
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub async fn replay(&self, query: EventQuery, options: ReplayOptions) -> Result<String> {
        self.replayer.replay(query, options).await
    }

    /// Replay `query` at `speed`, keeping only events accepted by a
    /// registered filter
    pub async fn replay_registered(
        &self,
        query: EventQuery,
        speed: f64,
        filter_id: &str,
    ) -> Result<String> {
        let filter = self.registered_filter(filter_id).await?;
        self.replayer
            .replay(query, ReplayOptions::new(speed).with_filter(filter))
            .await
    }

    pub async fn pause_replay(&self, id: &str) -> Result<()> {
        self.replayer.pause(id).await
    }

    pub async fn resume_replay(&self, id: &str) -> Result<()> {
        self.replayer.resume(id).await
    }

    pub async fn cancel_replay(&self, id: &str) -> Result<()> {
        self.replayer.cancel(id).await
    }

    pub async fn replay_status(&self, id: &str) -> Result<ReplayStatus> {
        self.replayer.status(id).await
    }

    pub async fn wait_replay(&self, id: &str) -> Result<ReplayStatus> {
        self.replayer.wait(id).await
    }

    pub async fn replays(&self) -> Vec<ReplayStatus> {
        self.replayer.sessions().await
    }

    /// Forget every finished replay session, returning how many were dropped
    pub async fn prune_replays(&self) -> usize {
        self.replayer.prune_finished().await
    }

    // ========================================================================
    // Filters
    // ========================================================================

    /// Build and register a reusable filter
    pub async fn create_filter(&self, config: &FilterConfig) -> Result<String> {
        let filter = config.build()?;
        let id = Uuid::new_v4().to_string();

        self.filters.write().await.insert(
            id.clone(),
            FilterEntry {
                config: config.clone(),
                filter,
                created_at: Utc::now(),
            },
        );
        debug!(filter_id = %id, "Filter registered");
        Ok(id)
    }

    /// Unregister a filter. Subscriptions and streams already built from it
    /// keep working.
    pub async fn remove_filter(&self, id: &str) -> Result<()> {
        self.filters
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("filter {}", id)))
    }

    pub async fn filters(&self) -> Vec<FilterInfo> {
        let mut filters: Vec<FilterInfo> = self
            .filters
            .read()
            .await
            .iter()
            .map(|(id, entry)| FilterInfo {
                id: id.clone(),
                config: entry.config.clone(),
                created_at: entry.created_at,
            })
            .collect();
        filters.sort_by_key(|f| f.created_at);
        filters
    }

    pub async fn registered_filter(&self, id: &str) -> Result<SharedFilter> {
        self.filters
            .read()
            .await
            .get(id)
            .map(|entry| entry.filter.clone())
            .ok_or_else(|| EngineError::NotFound(format!("filter {}", id)))
    }

    // ========================================================================
    // Aggregators
    // ========================================================================

    pub async fn create_aggregator(&self, config: AggregatorConfig) -> Result<String> {
        let aggregator = Arc::new(Aggregator::new(config, self.clock.clone())?);
        let subscription = self
            .bus
            .subscribe(aggregator.filter(), aggregator.clone())
            .await?;
        let id = aggregator.id().to_string();

        debug!(aggregator_id = %id, name = %aggregator.name(), "Aggregator created");
        self.aggregators.write().await.insert(
            id.clone(),
            AggregatorEntry {
                aggregator,
                subscription,
            },
        );
        Ok(id)
    }

    pub async fn aggregated_data(&self, id: &str) -> Result<AggregateSnapshot> {
        Ok(self.aggregator(id).await?.snapshot())
    }

    pub async fn reset_aggregator(&self, id: &str) -> Result<()> {
        self.aggregator(id).await?.reset();
        Ok(())
    }

    pub async fn remove_aggregator(&self, id: &str) -> Result<()> {
        let entry = self
            .aggregators
            .write()
            .await
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(format!("aggregator {}", id)))?;
        self.bus.unsubscribe(entry.subscription).await;
        debug!(aggregator_id = %id, "Aggregator removed");
        Ok(())
    }

    pub async fn aggregators(&self) -> Vec<AggregateSnapshot> {
        let mut snapshots: Vec<AggregateSnapshot> = self
            .aggregators
            .read()
            .await
            .values()
            .map(|e| e.aggregator.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    async fn aggregator(&self, id: &str) -> Result<Arc<Aggregator>> {
        self.aggregators
            .read()
            .await
            .get(id)
            .map(|e| e.aggregator.clone())
            .ok_or_else(|| EngineError::NotFound(format!("aggregator {}", id)))
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    pub async fn register_codec(&self, codec: Arc<dyn EventCodec>) {
        self.codecs.register(codec).await
    }

    pub async fn serialize(&self, event: &Event, format: &str) -> Result<Vec<u8>> {
        self.codecs.serialize(event, format).await
    }

    pub async fn deserialize(&self, bytes: &[u8], format: &str) -> Result<Event> {
        self.codecs.deserialize(bytes, format).await
    }

    pub async fn serialize_batch(&self, events: &[Event], format: &str) -> Vec<Result<Vec<u8>>> {
        self.codecs.serialize_batch(events, format).await
    }

    // ========================================================================
    // Stats / teardown
    // ========================================================================

    pub async fn stats(&self) -> Result<EngineStats> {
        let replays = self.replayer.sessions().await;
        Ok(EngineStats {
            storage: StorageStats {
                events: self.store.count().await?,
                recorder: self.recorder.stats().await,
            },
            bus: self.bus.stats().await,
            filters: self.filters.read().await.len(),
            aggregators: self.aggregators.read().await.len(),
            streams: self
                .streams
                .read()
                .await
                .values()
                .filter(|h| !h.is_closed())
                .count(),
            replay_sessions: replays.len(),
            active_replays: replays.iter().filter(|r| !r.state.is_finished()).count(),
        })
    }

    /// Stop recording, cancel every replay, close the bus and clear the
    /// registries. Safe to call more than once.
    pub async fn close(&self) {
        if self.bus.is_closed() {
            return;
        }

        self.recorder.stop().await;
        self.replayer.shutdown().await;
        self.bus.close().await;

        for handle in self.streams.write().await.drain().map(|(_, h)| h) {
            handle.mark_closed();
        }
        self.aggregators.write().await.clear();
        self.filters.write().await.clear();
        info!("Engine closed");
    }
}

/// Event type for a bridge event name; every dot-separated part must be
/// non-empty
fn bridge_kind(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.split('.').any(str::is_empty) {
        return Err(EngineError::InvalidConfiguration(format!(
            "invalid bridge event name '{}'",
            name
        )));
    }
    Ok(format!("{}.{}", EventKind::BRIDGE_PREFIX, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregateFunction;
    use crate::clock::FakeClock;
    use crate::replay::ReplayState;
    use chrono::Duration;
    use parking_lot::Mutex;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_with_filter_config() {
        let engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let filter = FilterConfig::from_json(serde_json::json!({
            "type": "composite",
            "op": "AND",
            "filters": [
                {"type": "pattern", "pattern": "agent.*"},
                {"type": "agent", "agentID": "agent1"}
            ]
        }))
        .unwrap();
        engine
            .subscribe_with_filter(
                &filter,
                Arc::new(move |e: &Event| -> anyhow::Result<()> {
                    sink.lock().push(e.kind.clone());
                    Ok(())
                }),
            )
            .await
            .unwrap();

        engine
            .publish(&Event::for_agent("agent.started", "agent1", Value::Null))
            .await
            .unwrap();
        engine
            .publish(&Event::for_agent("agent.started", "agent2", Value::Null))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec!["agent.started"]);
    }

    #[tokio::test]
    async fn test_bridge_event() {
        let engine = engine();
        let mut stream = engine
            .create_stream_with_filter(Some(&FilterConfig::pattern("bridge.*")))
            .await
            .unwrap();

        let event = engine
            .publish_bridge_event("custom", Value::object([("msg", "hi")]))
            .await
            .unwrap();

        assert_eq!(event.kind, "bridge.custom");
        assert_eq!(stream.next().await.unwrap(), event);
        assert!(engine.publish_bridge_event("", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_on_bridge_event() {
        let engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine
            .on_bridge_event(
                "deploy",
                Arc::new(move |e: &Event| -> anyhow::Result<()> {
                    sink.lock().push(e.kind.clone());
                    Ok(())
                }),
            )
            .await
            .unwrap();

        engine.publish_bridge_event("deploy", Value::Null).await.unwrap();
        engine.publish_bridge_event("deploy.done", Value::Null).await.unwrap();
        engine.publish_bridge_event("rollback", Value::Null).await.unwrap();

        assert_eq!(*seen.lock(), vec!["bridge.deploy"]);
        assert!(matches!(
            engine
                .on_bridge_event("a..b", Arc::new(|_: &Event| -> anyhow::Result<()> { Ok(()) }))
                .await,
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_filter_registry() {
        let engine = engine();
        let id = engine
            .create_filter(&FilterConfig::pattern("tool.*"))
            .await
            .unwrap();

        let filters = engine.filters().await;
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].id, id);
        assert_eq!(filters[0].config, FilterConfig::pattern("tool.*"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine
            .subscribe_registered(
                &id,
                Arc::new(move |e: &Event| -> anyhow::Result<()> {
                    sink.lock().push(e.kind.clone());
                    Ok(())
                }),
            )
            .await
            .unwrap();
        let mut stream = engine.create_stream_registered(&id).await.unwrap();

        engine
            .publish(&Event::new("tool.called", Value::Null))
            .await
            .unwrap();
        engine
            .publish(&Event::new("agent.started", Value::Null))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec!["tool.called"]);
        assert_eq!(stream.next().await.unwrap().kind, "tool.called");
        assert!(stream.try_next().is_none());
        assert_eq!(engine.stats().await.unwrap().filters, 1);

        engine.remove_filter(&id).await.unwrap();
        assert!(engine.filters().await.is_empty());
        assert!(matches!(
            engine.remove_filter(&id).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.create_stream_registered(&id).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.create_filter(&FilterConfig::pattern("")).await,
            Err(EngineError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn test_replay_through_registered_filter() {
        let engine = engine();
        let base = Utc::now() - Duration::minutes(1);
        for kind in ["tool.called", "agent.started", "tool.completed"] {
            engine
                .store_event(Event::new(kind, Value::Null).with_timestamp(base))
                .await
                .unwrap();
        }
        let filter_id = engine
            .create_filter(&FilterConfig::pattern("tool.*"))
            .await
            .unwrap();

        let id = engine
            .replay_registered(engine.new_query(), 1.0, &filter_id)
            .await
            .unwrap();
        let status = engine.wait_replay(&id).await.unwrap();
        assert_eq!(status.total, 2);
        assert_eq!(status.state, ReplayState::Completed);

        assert_eq!(engine.prune_replays().await, 1);
        assert!(engine.replays().await.is_empty());
        assert!(matches!(
            engine
                .replay_registered(engine.new_query(), 1.0, "missing")
                .await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_aggregator_registry() {
        let clock = FakeClock::new();
        let engine = Engine::with_parts(
            EngineConfig::default(),
            Arc::new(MemoryEventStore::new()),
            Arc::new(clock.clone()),
        )
        .unwrap();

        let id = engine
            .create_aggregator(
                AggregatorConfig::new("tools", 5.0)
                    .with_filter(FilterConfig::pattern("tool.*"))
                    .with_function(AggregateFunction::Count, None),
            )
            .await
            .unwrap();

        engine
            .publish(&Event::new("tool.called", Value::Null).with_timestamp(clock.now()))
            .await
            .unwrap();
        engine
            .publish(&Event::new("agent.started", Value::Null).with_timestamp(clock.now()))
            .await
            .unwrap();
        clock.advance(Duration::seconds(6));
        engine
            .publish(&Event::new("tool.completed", Value::Null).with_timestamp(clock.now()))
            .await
            .unwrap();

        let data = engine.aggregated_data(&id).await.unwrap();
        assert_eq!(data.name, "tools");
        assert_eq!(data.count, 1);
        assert_eq!(data.window, 5.0);

        engine.reset_aggregator(&id).await.unwrap();
        assert_eq!(engine.aggregated_data(&id).await.unwrap().count, 0);

        engine.remove_aggregator(&id).await.unwrap();
        assert!(matches!(
            engine.aggregated_data(&id).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.remove_aggregator(&id).await,
            Err(EngineError::NotFound(_))
        ));
        assert_eq!(engine.bus().subscription_count().await, 0);

        assert!(matches!(
            engine
                .create_aggregator(AggregatorConfig::new("bad", 0.0))
                .await,
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_registry() {
        let engine = engine();
        let mut stream = engine.create_stream(Arc::new(AcceptAll)).await.unwrap();
        let id = stream.id().to_string();
        assert_eq!(engine.streams().await.len(), 1);

        engine
            .publish(&Event::new("a.b", Value::Null))
            .await
            .unwrap();
        engine.stop_stream(&id).await.unwrap();

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
        assert!(engine.streams().await.is_empty());
        assert!(matches!(
            engine.stop_stream(&id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stats_and_close() {
        let engine = engine();
        engine.start_recording(None).await.unwrap();
        engine
            .create_aggregator(AggregatorConfig::new("all", 60.0))
            .await
            .unwrap();
        let _stream = engine.create_stream(Arc::new(AcceptAll)).await.unwrap();

        engine
            .publish(&Event::new("a.b", Value::Null))
            .await
            .unwrap();
        engine.stop_recording().await;

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.storage.events, 1);
        assert_eq!(stats.storage.recorder.recorded, 1);
        assert_eq!(stats.bus.published, 1);
        assert_eq!(stats.aggregators, 1);
        assert_eq!(stats.streams, 1);

        let json = serde_json::to_value(&stats).unwrap();
        for key in ["storage", "bus", "aggregators", "streams"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }

        engine.close().await;
        engine.close().await;

        let stats = engine.stats().await.unwrap();
        assert!(stats.bus.closed);
        assert_eq!(stats.aggregators, 0);
        assert_eq!(stats.streams, 0);
        assert!(matches!(
            engine.publish(&Event::new("a.b", Value::Null)).await,
            Err(EngineError::BusClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_replays() {
        let engine = engine();
        let base = Utc::now();
        for i in 0..3 {
            engine
                .store_event(
                    Event::new("tool.called", Value::from(i))
                        .with_timestamp(base + Duration::seconds(i * 30)),
                )
                .await
                .unwrap();
        }

        let id = engine
            .replay(engine.new_query(), ReplayOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        engine.close().await;

        let status = engine.wait_replay(&id).await.unwrap();
        assert_eq!(status.state, ReplayState::Cancelled);
        assert!(status.emitted < 3);
    }

    #[tokio::test]
    async fn test_serialization_roundtrip_through_engine() {
        let engine = engine();
        let event = Event::new("workflow.completed", Value::object([("steps", 3)]));

        let bytes = engine.serialize(&event, "json").await.unwrap();
        assert_eq!(engine.deserialize(&bytes, "json").await.unwrap(), event);

        let batch = engine
            .serialize_batch(&[event.clone(), event], "json-pretty")
            .await;
        assert!(batch.iter().all(|r| r.is_ok()));
    }
}
