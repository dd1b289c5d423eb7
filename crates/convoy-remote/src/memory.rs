//! In-process loopback backend: real tables, real event fan-out, scriptable
//! failures. This is the development/test double for the hosted backend, not
//! a product — state lives only as long as the process.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use convoy_core::types::{ChangeEvent, EventType, Record};
use convoy_core::RemoteError;

use crate::store::{ChangeSession, RecordMatch, RemoteStore};

const EVENT_CHANNEL_CAPACITY: usize = 256;

type RpcHandler = Box<dyn Fn(Value) -> Result<Value, RemoteError> + Send + Sync>;

struct Subscriber {
    tables: Vec<String>,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct MemoryInner {
    tables: Mutex<HashMap<String, BTreeMap<String, Record>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    rpc_handlers: Mutex<HashMap<String, RpcHandler>>,
    fail_next: Mutex<VecDeque<RemoteError>>,
    op_log: Mutex<Vec<String>>,
    healthy: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<MemoryInner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let remote = MemoryRemote::default();
        remote.inner.healthy.store(true, Ordering::SeqCst);
        remote
    }

    /// Queue an error to be returned by the next store operation.
    /// Each injected error fails exactly one call, in FIFO order.
    pub fn inject_failure(&self, err: RemoteError) {
        self.inner.fail_next.lock().unwrap().push_back(err);
    }

    /// Flip the health probe (drives the daemon's offline detection in tests).
    pub fn set_healthy(&self, healthy: bool) {
        self.inner.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Register a server-side function for `rpc`.
    pub fn register_rpc(
        &self,
        name: impl Into<String>,
        handler: impl Fn(Value) -> Result<Value, RemoteError> + Send + Sync + 'static,
    ) {
        self.inner
            .rpc_handlers
            .lock()
            .unwrap()
            .insert(name.into(), Box::new(handler));
    }

    /// Snapshot of one table, ordered by key.
    pub fn records(&self, table: &str) -> Vec<Record> {
        self.inner
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Seed a row without emitting a change event (test fixture setup).
    pub fn seed(&self, table: &str, record: Record) {
        self.inner
            .tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(record.key.clone(), record);
    }

    /// Drop every open change session, simulating a backend-side disconnect.
    pub fn close_sessions(&self) {
        self.inner.subscribers.lock().unwrap().clear();
    }

    /// Ordered log of mutating operations ("upsert:table:key", "delete:table:key").
    pub fn op_log(&self) -> Vec<String> {
        self.inner.op_log.lock().unwrap().clone()
    }

    pub fn session_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    fn take_injected(&self) -> Option<RemoteError> {
        self.inner.fail_next.lock().unwrap().pop_front()
    }

    fn broadcast(&self, event: ChangeEvent) {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        subscribers.retain(|sub| {
            if !sub.tables.iter().any(|t| t == &event.table) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(table = %event.table, "change channel full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn upsert(&self, table: &str, key: &str, payload: Value) -> Result<Record, RemoteError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }

        let record = Record {
            key: key.to_string(),
            payload,
            updated_at: Utc::now(),
        };
        self.inner
            .op_log
            .lock()
            .unwrap()
            .push(format!("upsert:{table}:{key}"));

        let previous = self
            .inner
            .tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), record.clone());

        let event_type = if previous.is_some() {
            EventType::Update
        } else {
            EventType::Insert
        };
        debug!(table, key, event = ?event_type, "upsert");

        self.broadcast(ChangeEvent {
            table: table.to_string(),
            event_type,
            new_record: Some(record.clone()),
            old_record: previous,
        });

        Ok(record)
    }

    async fn delete(&self, table: &str, matcher: &RecordMatch) -> Result<(), RemoteError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }

        self.inner
            .op_log
            .lock()
            .unwrap()
            .push(format!("delete:{table}:{}", matcher.key));

        let removed = self
            .inner
            .tables
            .lock()
            .unwrap()
            .get_mut(table)
            .and_then(|rows| rows.remove(&matcher.key));

        if let Some(old) = removed {
            debug!(table, key = %matcher.key, "delete");
            self.broadcast(ChangeEvent {
                table: table.to_string(),
                event_type: EventType::Delete,
                new_record: None,
                old_record: Some(old),
            });
        }

        Ok(())
    }

    async fn fetch_all(&self, table: &str) -> Result<Vec<Record>, RemoteError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        Ok(self.records(table))
    }

    async fn rpc(&self, name: &str, args: Value) -> Result<Value, RemoteError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let handlers = self.inner.rpc_handlers.lock().unwrap();
        match handlers.get(name) {
            Some(handler) => handler(args),
            None => Err(RemoteError::permanent(format!("unknown rpc: {name}"))),
        }
    }

    async fn subscribe_changes(&self, tables: &[String]) -> Result<ChangeSession, RemoteError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.inner.subscribers.lock().unwrap().push(Subscriber {
            tables: tables.to_vec(),
            tx,
        });
        debug!(tables = tables.len(), "change session opened");
        Ok(ChangeSession::from_receiver(rx))
    }

    async fn health(&self) -> Result<(), RemoteError> {
        if self.inner.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::transient("backend unreachable"))
        }
    }
}
