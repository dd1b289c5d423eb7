//! One realtime session, many consumers.
//!
//! The multiplexer opens a single change-stream session covering the full
//! static topic list and fans deduplicated events out to per-topic listener
//! lists. Duplicate `(topic, event type, entity id)` keys inside the
//! debounce window are dropped. `pause()` stops dispatch without closing the
//! session; `resume()` restores dispatch and reconnects if the session had
//! dropped. On a session error the multiplexer tears down and reconnects
//! once after a fixed delay; if that attempt also fails it stays
//! disconnected and reports degraded connectivity.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use convoy_core::config::RealtimeConfig;
use convoy_core::types::{ChangeEvent, EventType};
use convoy_core::{ConvoyError, ConvoyResult};
use convoy_remote::{ChangeSession, RemoteStore};

pub type ListenerFn = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MuxState {
    Disconnected,
    Connecting,
    Connected,
    Paused,
}

#[derive(Debug, Clone, Serialize)]
pub struct MuxStatus {
    pub state: MuxState,
    pub degraded: bool,
    pub listeners: usize,
}

type EventKey = (String, EventType, String);

struct MuxInner {
    remote: Arc<dyn RemoteStore>,
    topics: Vec<String>,
    listeners: Mutex<HashMap<String, Vec<(u64, ListenerFn)>>>,
    next_listener_id: AtomicU64,
    state: Mutex<MuxState>,
    paused: AtomicBool,
    degraded: AtomicBool,
    recent: Mutex<HashMap<EventKey, Instant>>,
    debounce: Duration,
    reconnect_delay: Duration,
    recent_cap: usize,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ChangeMultiplexer {
    inner: Arc<MuxInner>,
    /// Serializes connect attempts so only one session is ever opened.
    connect_lock: Arc<TokioMutex<()>>,
}

impl ChangeMultiplexer {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        topics: Vec<String>,
        config: &RealtimeConfig,
    ) -> Self {
        ChangeMultiplexer {
            inner: Arc::new(MuxInner {
                remote,
                topics,
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                state: Mutex::new(MuxState::Disconnected),
                paused: AtomicBool::new(false),
                degraded: AtomicBool::new(false),
                recent: Mutex::new(HashMap::new()),
                debounce: Duration::from_millis(config.debounce_ms),
                reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
                recent_cap: config.recent_events_cap,
                task: Mutex::new(None),
            }),
            connect_lock: Arc::new(TokioMutex::new(())),
        }
    }

    /// Register a listener. Opens the one remote session on the first call;
    /// later calls never reopen it. The returned guard unregisters the
    /// listener when dropped (or via `unsubscribe`).
    pub async fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> ConvoyResult<Subscription> {
        if !self.inner.topics.iter().any(|t| t == topic) {
            return Err(ConvoyError::UnknownEntity(topic.to_string()));
        }

        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        debug!(topic, id, "listener registered");

        let subscription = Subscription {
            topic: topic.to_string(),
            id,
            inner: Arc::downgrade(&self.inner),
        };

        // The registration survives a failed connect; a later resume() or
        // connect() picks it up.
        self.connect().await?;
        Ok(subscription)
    }

    /// Open the session if it is not already open. Idempotent.
    pub async fn connect(&self) -> ConvoyResult<()> {
        let _guard = self.connect_lock.lock().await;

        if self.session_task_alive() {
            return Ok(());
        }

        self.inner.set_state(MuxState::Connecting);
        let session = match self.inner.remote.subscribe_changes(&self.inner.topics).await {
            Ok(session) => session,
            Err(err) => {
                self.inner.set_state(MuxState::Disconnected);
                self.inner.degraded.store(true, Ordering::SeqCst);
                return Err(err.into());
            }
        };

        self.inner.degraded.store(false, Ordering::SeqCst);
        self.inner.set_state(if self.inner.paused.load(Ordering::SeqCst) {
            MuxState::Paused
        } else {
            MuxState::Connected
        });
        info!(topics = self.inner.topics.len(), "change session open");

        let inner = self.inner.clone();
        let handle = tokio::spawn(run_session(inner, session));
        *self.inner.task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop dispatch (app going to background). The session stays open;
    /// events arriving while paused are dropped, not queued.
    pub fn pause(&self) {
        if self.inner.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        if *state == MuxState::Connected {
            *state = MuxState::Paused;
        }
        info!("realtime dispatch paused");
    }

    /// Restore dispatch and reconnect if the session dropped while paused.
    pub async fn resume(&self) -> ConvoyResult<()> {
        if !self.inner.paused.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("realtime dispatch resumed");

        if self.session_task_alive() {
            self.inner.set_state(MuxState::Connected);
            Ok(())
        } else {
            self.connect().await
        }
    }

    pub fn state(&self) -> MuxState {
        *self.inner.state.lock().unwrap()
    }

    pub fn status(&self) -> MuxStatus {
        let listeners = self
            .inner
            .listeners
            .lock()
            .unwrap()
            .values()
            .map(|l| l.len())
            .sum();
        MuxStatus {
            state: self.state(),
            degraded: self.inner.degraded.load(Ordering::SeqCst),
            listeners,
        }
    }

    /// Tear the session down and drop every listener registration.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.task.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.listeners.lock().unwrap().clear();
        self.inner.recent.lock().unwrap().clear();
        self.inner.set_state(MuxState::Disconnected);
        info!("multiplexer shut down");
    }

    fn session_task_alive(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl MuxInner {
    fn set_state(&self, state: MuxState) {
        *self.state.lock().unwrap() = state;
    }

    /// Debounce, then fan out to the topic's listeners, preserving per-topic
    /// registration order. A panicking listener is isolated.
    fn dispatch(&self, event: &ChangeEvent) {
        if self.paused.load(Ordering::SeqCst) {
            debug!(table = %event.table, "event dropped (paused)");
            return;
        }

        let key: EventKey = (
            event.table.clone(),
            event.event_type,
            event.entity_id().unwrap_or_default().to_string(),
        );
        let now = Instant::now();
        {
            let mut recent = self.recent.lock().unwrap();
            if let Some(last) = recent.get(&key) {
                if now.duration_since(*last) < self.debounce {
                    debug!(table = %key.0, entity = %key.2, "duplicate event debounced");
                    return;
                }
            }
            recent.insert(key, now);

            if recent.len() > self.recent_cap {
                let horizon = self.debounce;
                recent.retain(|_, seen| now.duration_since(*seen) < horizon);
            }
        }

        let callbacks: Vec<ListenerFn> = self
            .listeners
            .lock()
            .unwrap()
            .get(&event.table)
            .map(|listeners| listeners.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        for callback in callbacks {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
            if result.is_err() {
                warn!(table = %event.table, "listener panicked; continuing dispatch");
            }
        }
    }

    fn remove_listener(&self, topic: &str, id: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            if let Some(list) = listeners.get_mut(topic) {
                list.retain(|(listener_id, _)| *listener_id != id);
            }
        }
    }
}

/// Session loop: dispatch until the stream ends, then one bounded reconnect
/// attempt after a fixed delay. A second consecutive failure leaves the
/// multiplexer disconnected and degraded until `resume()`/`connect()`.
async fn run_session(inner: Arc<MuxInner>, mut session: ChangeSession) {
    loop {
        while let Some(event) = session.next_event().await {
            inner.dispatch(&event);
        }

        warn!("change session ended");
        inner.set_state(MuxState::Disconnected);

        if inner.paused.load(Ordering::SeqCst) {
            // resume() reconnects when the app comes back.
            return;
        }

        tokio::time::sleep(inner.reconnect_delay).await;
        match inner.remote.subscribe_changes(&inner.topics).await {
            Ok(new_session) => {
                info!("change session reconnected");
                inner.degraded.store(false, Ordering::SeqCst);
                inner.set_state(if inner.paused.load(Ordering::SeqCst) {
                    MuxState::Paused
                } else {
                    MuxState::Connected
                });
                session = new_session;
            }
            Err(err) => {
                warn!("reconnect failed, realtime degraded: {err}");
                inner.degraded.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// Capability to remove one listener registration. Unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    id: u64,
    inner: Weak<MuxInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_listener(&self.topic, self.id);
            debug!(topic = %self.topic, id = self.id, "listener removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_remote::MemoryRemote;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn config_fast() -> RealtimeConfig {
        RealtimeConfig {
            debounce_ms: 200,
            reconnect_delay_ms: 20,
            recent_events_cap: 100,
        }
    }

    fn mux_over(remote: &MemoryRemote, config: RealtimeConfig) -> ChangeMultiplexer {
        ChangeMultiplexer::new(
            Arc::new(remote.clone()),
            vec!["notes".into(), "beings".into()],
            &config,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn subscribe_opens_session_once() {
        let remote = MemoryRemote::new();
        let mux = mux_over(&remote, config_fast());

        let _a = mux
            .subscribe("notes", |_| {})
            .await
            .unwrap();
        let _b = mux
            .subscribe("beings", |_| {})
            .await
            .unwrap();

        assert_eq!(remote.session_count(), 1);
        assert_eq!(mux.state(), MuxState::Connected);
    }

    #[tokio::test]
    async fn unknown_topic_is_rejected() {
        let remote = MemoryRemote::new();
        let mux = mux_over(&remote, config_fast());
        let err = mux.subscribe("leaderboards", |_| {}).await.unwrap_err();
        assert!(matches!(err, ConvoyError::UnknownEntity(_)));
    }

    #[tokio::test]
    async fn events_reach_topic_listeners() {
        let remote = MemoryRemote::new();
        let mux = mux_over(&remote, config_fast());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let _sub = mux
            .subscribe("notes", move |_| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        remote.upsert("notes", "n1", json!({})).await.unwrap();
        remote.upsert("beings", "b1", json!({})).await.unwrap();
        settle().await;

        // Only the notes event was dispatched to the notes listener.
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_events_are_debounced() {
        let remote = MemoryRemote::new();
        let mux = mux_over(&remote, config_fast());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let _sub = mux
            .subscribe("notes", move |_| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        // Same (topic, op, entity) twice inside the window.
        remote.upsert("notes", "n1", json!({"v": 1})).await.unwrap();
        remote.upsert("notes", "n1", json!({"v": 2})).await.unwrap();
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_entities_are_not_debounced() {
        let remote = MemoryRemote::new();
        let mux = mux_over(&remote, config_fast());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let _sub = mux
            .subscribe("notes", move |_| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        remote.upsert("notes", "n1", json!({})).await.unwrap();
        remote.upsert("notes", "n2", json!({})).await.unwrap();
        settle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pause_drops_dispatch_resume_restores() {
        let remote = MemoryRemote::new();
        let mux = mux_over(&remote, config_fast());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let _sub = mux
            .subscribe("notes", move |_| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        mux.pause();
        assert_eq!(mux.state(), MuxState::Paused);
        remote.upsert("notes", "n1", json!({})).await.unwrap();
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        mux.resume().await.unwrap();
        assert_eq!(mux.state(), MuxState::Connected);
        remote.upsert("notes", "n2", json!({})).await.unwrap();
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_drop_triggers_single_reconnect() {
        let remote = MemoryRemote::new();
        let mux = mux_over(&remote, config_fast());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let _sub = mux
            .subscribe("notes", move |_| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert_eq!(remote.session_count(), 1);

        // Backend drops the session; the mux reconnects once after the delay.
        remote.close_sessions();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(remote.session_count(), 1);
        assert_eq!(mux.state(), MuxState::Connected);
        assert!(!mux.status().degraded);

        remote.upsert("notes", "n1", json!({})).await.unwrap();
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let remote = MemoryRemote::new();
        let mux = mux_over(&remote, config_fast());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let sub = mux
            .subscribe("notes", move |_| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        sub.unsubscribe();
        remote.upsert("notes", "n1", json!({})).await.unwrap();
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(mux.status().listeners, 0);
    }

    #[tokio::test]
    async fn panicking_listener_is_isolated() {
        let remote = MemoryRemote::new();
        let mux = mux_over(&remote, config_fast());

        let _bad = mux
            .subscribe("notes", |_| panic!("listener bug"))
            .await
            .unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let _good = mux
            .subscribe("notes", move |_| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        remote.upsert("notes", "n1", json!({})).await.unwrap();
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_clears_listeners() {
        let remote = MemoryRemote::new();
        let mux = mux_over(&remote, config_fast());
        let _sub = mux.subscribe("notes", |_| {}).await.unwrap();

        mux.shutdown();
        assert_eq!(mux.state(), MuxState::Disconnected);
        assert_eq!(mux.status().listeners, 0);
    }
}
