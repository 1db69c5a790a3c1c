//! Paced re-publication of stored events.
//!
//! Each replay runs as its own task. The gap between two emitted events is
//! the gap between their original timestamps divided by the session speed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tidings_protocol::Event;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::{EngineError, Result};
use crate::filter::SharedFilter;
use crate::store::{EventQuery, EventStore};

/// Finished sessions kept around for `status` before the oldest are pruned
pub const DEFAULT_FINISHED_RETENTION: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayState {
    Running,
    Paused,
    Cancelled,
    Completed,
}

impl ReplayState {
    pub fn is_finished(&self) -> bool {
        matches!(self, ReplayState::Cancelled | ReplayState::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayState::Running => "running",
            ReplayState::Paused => "paused",
            ReplayState::Cancelled => "cancelled",
            ReplayState::Completed => "completed",
        }
    }
}

impl fmt::Display for ReplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct ReplayOptions {
    /// Playback rate; 2.0 replays twice as fast as recorded
    pub speed: f64,
    /// Applied to the query result before anything is emitted
    pub filter: Option<SharedFilter>,
}

impl ReplayOptions {
    pub fn new(speed: f64) -> Self {
        Self {
            speed,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: SharedFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStatus {
    pub id: String,
    pub state: ReplayState,
    pub speed: f64,
    pub emitted: usize,
    pub total: usize,
    pub query: EventQuery,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct Session {
    id: String,
    query: EventQuery,
    speed: f64,
    total: usize,
    emitted: AtomicUsize,
    state: watch::Sender<ReplayState>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl Session {
    fn state(&self) -> ReplayState {
        *self.state.borrow()
    }

    fn finished_error(&self, state: ReplayState) -> EngineError {
        EngineError::ReplayFinished {
            id: self.id.clone(),
            state: state.to_string(),
        }
    }

    /// Move from `from` to `to`. Same-state transitions are no-ops and a
    /// finished session refuses every transition.
    fn transition(&self, from: ReplayState, to: ReplayState) -> Result<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else if *state == to {
                false
            } else {
                outcome = Err(self.finished_error(*state));
                false
            }
        });
        outcome
    }

    fn cancel(&self) -> Result<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            if state.is_finished() {
                outcome = Err(self.finished_error(*state));
                false
            } else {
                *state = ReplayState::Cancelled;
                true
            }
        });
        self.cancel.cancel();
        if outcome.is_ok() {
            self.mark_finished();
        }
        outcome
    }

    /// Record the terminal state once; an earlier cancel wins over completion
    fn finish(&self, terminal: ReplayState) {
        let changed = self.state.send_if_modified(|state| {
            if state.is_finished() {
                false
            } else {
                *state = terminal;
                true
            }
        });
        if changed {
            self.mark_finished();
        }
    }

    fn mark_finished(&self) {
        self.finished_at.lock().get_or_insert_with(Utc::now);
    }

    fn status(&self) -> ReplayStatus {
        ReplayStatus {
            id: self.id.clone(),
            state: self.state(),
            speed: self.speed,
            emitted: self.emitted.load(Ordering::SeqCst),
            total: self.total,
            query: self.query.clone(),
            started_at: self.started_at,
            finished_at: *self.finished_at.lock(),
        }
    }
}

/// Event Replayer
///
/// Owns every replay session started through it. Shutting the replayer down
/// cancels all of them.
pub struct Replayer {
    bus: Arc<EventBus>,
    store: Arc<dyn EventStore>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    shutdown: CancellationToken,
    retention: usize,
}

impl Replayer {
    pub fn new(bus: Arc<EventBus>, store: Arc<dyn EventStore>) -> Self {
        Self::with_retention(bus, store, DEFAULT_FINISHED_RETENTION)
    }

    /// Keep at most `retention` finished sessions. Older ones are dropped
    /// whenever a new replay starts.
    pub fn with_retention(bus: Arc<EventBus>, store: Arc<dyn EventStore>, retention: usize) -> Self {
        Self {
            bus,
            store,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            retention,
        }
    }

    /// Start replaying the events matched by `query`. Returns the session id
    /// right away; emission happens in the background.
    pub async fn replay(&self, query: EventQuery, options: ReplayOptions) -> Result<String> {
        if !options.speed.is_finite() || options.speed <= 0.0 {
            return Err(EngineError::InvalidConfiguration(format!(
                "replay speed must be a positive number, got {}",
                options.speed
            )));
        }
        if self.shutdown.is_cancelled() || self.bus.is_closed() {
            return Err(EngineError::BusClosed);
        }

        let mut events = self.store.query(&query).await?;
        if let Some(filter) = &options.filter {
            events.retain(|e| filter.accepts(e));
        }

        let (state, _) = watch::channel(ReplayState::Running);
        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            query,
            speed: options.speed,
            total: events.len(),
            emitted: AtomicUsize::new(0),
            state,
            cancel: self.shutdown.child_token(),
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
        });

        {
            let mut sessions = self.sessions.write().await;
            evict_finished(&mut sessions, self.retention);
            sessions.insert(session.id.clone(), session.clone());
        }

        info!(
            session_id = %session.id,
            total = session.total,
            speed = session.speed,
            "Replay started"
        );

        let id = session.id.clone();
        tokio::spawn(run_session(self.bus.clone(), session, events));
        Ok(id)
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let session = self.session(id).await?;
        session.transition(ReplayState::Running, ReplayState::Paused)?;
        debug!(session_id = %id, "Replay paused");
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        let session = self.session(id).await?;
        session.transition(ReplayState::Paused, ReplayState::Running)?;
        debug!(session_id = %id, "Replay resumed");
        Ok(())
    }

    /// Stop a session for good. Events already emitted stay published.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let session = self.session(id).await?;
        session.cancel()?;
        info!(session_id = %id, emitted = session.emitted.load(Ordering::SeqCst), "Replay cancelled");
        Ok(())
    }

    pub async fn status(&self, id: &str) -> Result<ReplayStatus> {
        Ok(self.session(id).await?.status())
    }

    pub async fn sessions(&self) -> Vec<ReplayStatus> {
        let mut statuses: Vec<ReplayStatus> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.status())
            .collect();
        statuses.sort_by_key(|s| s.started_at);
        statuses
    }

    /// Wait until the session completes or is cancelled
    pub async fn wait(&self, id: &str) -> Result<ReplayStatus> {
        let session = self.session(id).await?;
        let mut rx = session.state.subscribe();
        // The sender lives in `session`, so this only fails if it was dropped
        let _ = rx.wait_for(|state| state.is_finished()).await;
        Ok(session.status())
    }

    /// Drop finished sessions from the registry, returning how many were removed
    pub async fn prune_finished(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.state().is_finished());
        before - sessions.len()
    }

    /// Cancel every session, running or paused
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.finish(ReplayState::Cancelled);
        }
    }

    async fn session(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("replay session {}", id)))
    }
}

/// Drop the oldest finished sessions until at most `keep` remain
fn evict_finished(sessions: &mut HashMap<String, Arc<Session>>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, String)> = sessions
        .values()
        .filter(|s| s.state().is_finished())
        .map(|s| (s.started_at, s.id.clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        sessions.remove(&id);
    }
}

/// Delay between two events at the given speed. Negative gaps become zero and
/// delays too long to represent saturate.
fn scaled_delay(previous: DateTime<Utc>, next: DateTime<Utc>, speed: f64) -> Duration {
    match (next - previous).to_std() {
        Ok(gap) => Duration::try_from_secs_f64(gap.as_secs_f64() / speed).unwrap_or(Duration::MAX),
        Err(_) => Duration::ZERO,
    }
}

/// Marks the session cancelled if the task unwinds before reaching a
/// terminal state
struct FinishGuard(Arc<Session>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish(ReplayState::Cancelled);
    }
}

async fn run_session(bus: Arc<EventBus>, session: Arc<Session>, events: Vec<Event>) {
    let _guard = FinishGuard(session.clone());
    let cancel = session.cancel.clone();
    let mut state_rx = session.state.subscribe();
    let mut previous: Option<DateTime<Utc>> = None;
    let mut terminal = ReplayState::Completed;

    for event in events {
        if let Some(prev) = previous {
            let delay = scaled_delay(prev, event.timestamp, session.speed);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        terminal = ReplayState::Cancelled;
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        // Hold position while paused
        while *state_rx.borrow_and_update() == ReplayState::Paused {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        if cancel.is_cancelled() || session.state().is_finished() {
            terminal = ReplayState::Cancelled;
            break;
        }

        previous = Some(event.timestamp);
        match bus.publish(&event).await {
            Ok(_) => {
                session.emitted.fetch_add(1, Ordering::SeqCst);
            }
            Err(EngineError::BusClosed) => {
                warn!(session_id = %session.id, "Event bus closed during replay");
                terminal = ReplayState::Cancelled;
                break;
            }
            Err(e) => {
                warn!(session_id = %session.id, event_id = %event.id, "Failed to replay event: {}", e);
            }
        }
    }

    session.finish(terminal);
    info!(
        session_id = %session.id,
        state = %session.state(),
        emitted = session.emitted.load(Ordering::SeqCst),
        total = session.total,
        "Replay finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AcceptAll, PatternFilter};
    use crate::store::MemoryEventStore;
    use chrono::Duration as ChronoDuration;
    use tidings_protocol::Value;

    struct Harness {
        bus: Arc<EventBus>,
        replayer: Replayer,
        seen: Arc<Mutex<Vec<String>>>,
    }

    async fn harness(events: Vec<Event>) -> Harness {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(MemoryEventStore::new());
        for event in events {
            store.store(event).await.unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            Arc::new(AcceptAll),
            Arc::new(move |e: &Event| -> anyhow::Result<()> {
                sink.lock().push(e.id.clone());
                Ok(())
            }),
        )
        .await
        .unwrap();

        Harness {
            replayer: Replayer::new(bus.clone(), store),
            bus,
            seen,
        }
    }

    fn spaced(count: i64, gap_secs: i64) -> Vec<Event> {
        let base = Utc::now() - ChronoDuration::hours(1);
        (0..count)
            .map(|i| {
                Event::new("tool.called", Value::from(i))
                    .with_id(format!("e{}", i))
                    .with_timestamp(base + ChronoDuration::seconds(i * gap_secs))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_replay_completes_in_order() {
        let h = harness(spaced(3, 0)).await;

        let id = h
            .replayer
            .replay(EventQuery::new(), ReplayOptions::default())
            .await
            .unwrap();
        let status = h.replayer.wait(&id).await.unwrap();

        assert_eq!(status.state, ReplayState::Completed);
        assert_eq!(status.emitted, 3);
        assert_eq!(status.total, 3);
        assert!(status.finished_at.is_some());
        assert_eq!(*h.seen.lock(), vec!["e0", "e1", "e2"]);
    }

    #[tokio::test]
    async fn test_invalid_speed_is_rejected() {
        let h = harness(vec![]).await;
        for speed in [0.0, -1.0, f64::INFINITY, f64::NAN] {
            assert!(matches!(
                h.replayer
                    .replay(EventQuery::new(), ReplayOptions::new(speed))
                    .await,
                Err(EngineError::InvalidConfiguration(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_replay_filter() {
        let mut events = spaced(2, 0);
        events.push(Event::new("agent.started", Value::Null).with_id("agent"));
        let h = harness(events).await;

        let options =
            ReplayOptions::default().with_filter(Arc::new(PatternFilter::new("agent.*").unwrap()));
        let id = h.replayer.replay(EventQuery::new(), options).await.unwrap();
        let status = h.replayer.wait(&id).await.unwrap();

        assert_eq!(status.total, 1);
        assert_eq!(*h.seen.lock(), vec!["agent"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_keeps_position() {
        let h = harness(spaced(3, 10)).await;
        let id = h
            .replayer
            .replay(EventQuery::new(), ReplayOptions::default())
            .await
            .unwrap();

        // First event goes out immediately, the second is 10s later
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.replayer.pause(&id).await.unwrap();
        assert_eq!(h.replayer.status(&id).await.unwrap().state, ReplayState::Paused);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*h.seen.lock(), vec!["e0"]);

        h.replayer.resume(&id).await.unwrap();
        let status = h.replayer.wait(&id).await.unwrap();

        assert_eq!(status.state, ReplayState::Completed);
        assert_eq!(*h.seen.lock(), vec!["e0", "e1", "e2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_terminal() {
        let h = harness(spaced(3, 10)).await;
        let id = h
            .replayer
            .replay(EventQuery::new(), ReplayOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        h.replayer.cancel(&id).await.unwrap();
        let status = h.replayer.wait(&id).await.unwrap();

        assert_eq!(status.state, ReplayState::Cancelled);
        assert_eq!(status.emitted, 1);
        assert!(matches!(
            h.replayer.resume(&id).await,
            Err(EngineError::ReplayFinished { .. })
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*h.seen.lock(), vec!["e0"]);
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let h = harness(spaced(1, 0)).await;

        assert!(matches!(
            h.replayer.pause("missing").await,
            Err(EngineError::NotFound(_))
        ));

        let id = h
            .replayer
            .replay(EventQuery::new(), ReplayOptions::default())
            .await
            .unwrap();
        h.replayer.wait(&id).await.unwrap();

        assert!(matches!(
            h.replayer.pause(&id).await,
            Err(EngineError::ReplayFinished { .. })
        ));
        assert!(matches!(
            h.replayer.cancel(&id).await,
            Err(EngineError::ReplayFinished { .. })
        ));
        assert_eq!(h.replayer.prune_finished().await, 1);
        assert!(h.replayer.sessions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_independent() {
        let h = harness(spaced(2, 10)).await;
        let first = h
            .replayer
            .replay(EventQuery::new(), ReplayOptions::default())
            .await
            .unwrap();
        let second = h
            .replayer
            .replay(EventQuery::new(), ReplayOptions::new(5.0))
            .await
            .unwrap();

        h.replayer.cancel(&first).await.unwrap();
        let status = h.replayer.wait(&second).await.unwrap();

        assert_eq!(status.state, ReplayState::Completed);
        assert_eq!(status.emitted, 2);
        assert_eq!(
            h.replayer.status(&first).await.unwrap().state,
            ReplayState::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let h = harness(spaced(3, 10)).await;
        let running = h
            .replayer
            .replay(EventQuery::new(), ReplayOptions::default())
            .await
            .unwrap();
        let paused = h
            .replayer
            .replay(EventQuery::new(), ReplayOptions::default())
            .await
            .unwrap();
        h.replayer.pause(&paused).await.unwrap();

        h.replayer.shutdown().await;

        for id in [running, paused] {
            assert_eq!(
                h.replayer.wait(&id).await.unwrap().state,
                ReplayState::Cancelled
            );
        }
        assert!(matches!(
            h.replayer
                .replay(EventQuery::new(), ReplayOptions::default())
                .await,
            Err(EngineError::BusClosed)
        ));
        assert!(!h.bus.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_speed_still_reaches_terminal_state() {
        let h = harness(spaced(2, 1)).await;
        let id = h
            .replayer
            .replay(EventQuery::new(), ReplayOptions::new(1e-20))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = h.replayer.status(&id).await.unwrap();
        assert_eq!(status.state, ReplayState::Running);
        assert_eq!(status.emitted, 1);

        h.replayer.cancel(&id).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(1), h.replayer.wait(&id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, ReplayState::Cancelled);
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_stop_replay() {
        let h = harness(spaced(3, 0)).await;
        h.bus
            .subscribe(
                Arc::new(AcceptAll),
                Arc::new(|_: &Event| -> anyhow::Result<()> { panic!("downstream blew up") }),
            )
            .await
            .unwrap();
        h.bus
            .subscribe(
                Arc::new(AcceptAll),
                Arc::new(|_: &Event| -> anyhow::Result<()> { anyhow::bail!("rejected") }),
            )
            .await
            .unwrap();

        let id = h
            .replayer
            .replay(EventQuery::new(), ReplayOptions::default())
            .await
            .unwrap();
        let status = h.replayer.wait(&id).await.unwrap();

        assert_eq!(status.state, ReplayState::Completed);
        assert_eq!(status.emitted, status.total);
        assert_eq!(*h.seen.lock(), vec!["e0", "e1", "e2"]);
    }

    #[tokio::test]
    async fn test_finished_sessions_are_pruned_on_replay() {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(MemoryEventStore::new());
        store.store(Event::new("tool.called", Value::Null)).await.unwrap();
        let replayer = Replayer::with_retention(bus, store, 1);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = replayer
                .replay(EventQuery::new(), ReplayOptions::default())
                .await
                .unwrap();
            replayer.wait(&id).await.unwrap();
            ids.push(id);
        }

        // Pruned when the third replay started; the second is the one kept
        assert!(matches!(
            replayer.status(&ids[0]).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(replayer.status(&ids[1]).await.is_ok());
        assert_eq!(replayer.sessions().await.len(), 2);
    }

    #[test]
    fn test_scaled_delay() {
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(1);

        assert_eq!(scaled_delay(t0, t1, 2.0), Duration::from_millis(500));
        assert_eq!(scaled_delay(t0, t1, 1.0), Duration::from_secs(1));
        assert_eq!(scaled_delay(t0, t1, 0.5), Duration::from_secs(2));
        assert_eq!(scaled_delay(t1, t0, 1.0), Duration::ZERO);
        assert_eq!(scaled_delay(t0, t1, 1e-20), Duration::MAX);
    }
}
