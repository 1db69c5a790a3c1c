//! Integration tests for the Engine facade
//!
//! These tests drive the full path:
//! - Recording published events into the store
//! - Querying them back
//! - Replaying them onto the bus at different speeds

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::Instant;

use tidings_engine::{
    AcceptAll, Engine, EngineConfig, Event, EventQuery, JsonlEventStore, PatternFilter,
    ReplayOptions, ReplayState, Value,
};

/// Collect the arrival instant of every event published on the engine's bus
async fn arrival_log(engine: &Engine) -> Arc<Mutex<Vec<(String, Instant)>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    engine
        .subscribe(
            Arc::new(AcceptAll),
            Arc::new(move |e: &Event| -> anyhow::Result<()> {
                sink.lock().unwrap().push((e.id.clone(), Instant::now()));
                Ok(())
            }),
        )
        .await
        .unwrap();
    log
}

async fn engine_with_two_events_one_second_apart() -> Engine {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let base = Utc::now() - ChronoDuration::minutes(5);
    engine
        .store_event(Event::new("tool.called", Value::Null).with_id("first").with_timestamp(base))
        .await
        .unwrap();
    engine
        .store_event(
            Event::new("tool.completed", Value::Null)
                .with_id("second")
                .with_timestamp(base + ChronoDuration::seconds(1)),
        )
        .await
        .unwrap();
    engine
}

async fn replay_gap(speed: f64) -> Duration {
    let engine = engine_with_two_events_one_second_apart().await;
    let log = arrival_log(&engine).await;

    let id = engine
        .replay(EventQuery::new(), ReplayOptions::new(speed))
        .await
        .unwrap();
    let status = engine.wait_replay(&id).await.unwrap();
    assert_eq!(status.state, ReplayState::Completed);
    assert_eq!(status.emitted, 2);

    let log = log.lock().unwrap();
    assert_eq!(log[0].0, "first");
    assert_eq!(log[1].0, "second");
    log[1].1 - log[0].1
}

#[tokio::test(start_paused = true)]
async fn test_replay_at_double_speed() {
    let gap = replay_gap(2.0).await;
    assert!(
        gap >= Duration::from_millis(490) && gap <= Duration::from_millis(600),
        "gap was {:?}",
        gap
    );
}

#[tokio::test(start_paused = true)]
async fn test_replay_at_real_time() {
    let gap = replay_gap(1.0).await;
    assert!(
        gap >= Duration::from_millis(990) && gap <= Duration::from_millis(1100),
        "gap was {:?}",
        gap
    );
}

#[tokio::test]
async fn test_record_then_query_by_agent() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine.start_recording(None).await.unwrap();

    let event = Event::for_agent("agent.output", "writer-1", Value::from("chunk"))
        .with_agent_name("writer")
        .with_metadata("seq", 4)
        .with_error("partial");
    engine.publish(&event).await.unwrap();
    engine
        .publish(&Event::for_agent("agent.output", "writer-2", Value::Null))
        .await
        .unwrap();
    engine.stop_recording().await;

    let found = engine
        .query(&EventQuery::new().for_agent("writer-1"))
        .await
        .unwrap();
    assert_eq!(found, vec![event]);
}

#[tokio::test]
async fn test_default_query_is_capped() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let base = Utc::now();
    for i in 0..500 {
        engine
            .store_event(
                Event::new("metrics.recorded", Value::from(i))
                    .with_timestamp(base - ChronoDuration::seconds(i)),
            )
            .await
            .unwrap();
    }

    let events = engine.query(&EventQuery::default()).await.unwrap();

    assert_eq!(events.len(), 100);
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    // Oldest first: the event stored last carries the earliest timestamp
    assert_eq!(events[0].data, Value::from(499));
}

#[tokio::test]
async fn test_recorded_session_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.jsonl");

    {
        let store = Arc::new(JsonlEventStore::open(&path).await.unwrap());
        let engine = Engine::with_store(EngineConfig::default(), store).unwrap();
        engine
            .start_recording(Some(Arc::new(PatternFilter::new("workflow.*").unwrap())))
            .await
            .unwrap();
        for kind in ["workflow.started", "agent.output", "workflow.completed"] {
            engine.publish(&Event::new(kind, Value::Null)).await.unwrap();
        }
        engine.close().await;
    }

    let store = Arc::new(JsonlEventStore::open(&path).await.unwrap());
    let engine = Engine::with_store(EngineConfig::default(), store).unwrap();
    let log = arrival_log(&engine).await;

    let id = engine
        .replay(EventQuery::new(), ReplayOptions::new(1000.0))
        .await
        .unwrap();
    let status = engine.wait_replay(&id).await.unwrap();

    assert_eq!(status.total, 2);
    assert_eq!(status.state, ReplayState::Completed);
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_export_import_between_engines() {
    let source = Engine::new(EngineConfig::default()).unwrap();
    for i in 0..5 {
        source
            .store_event(Event::for_agent("tool.called", "a1", Value::from(i)))
            .await
            .unwrap();
    }

    let mut buffer: Vec<u8> = Vec::new();
    assert_eq!(source.export_store(&mut buffer).await.unwrap(), 5);

    let target = Engine::new(EngineConfig::default()).unwrap();
    let report = target.import_store(buffer.as_slice()).await.unwrap();
    assert_eq!(report.imported, 5);

    let stats = target.stats().await.unwrap();
    assert_eq!(stats.storage.events, 5);
}
