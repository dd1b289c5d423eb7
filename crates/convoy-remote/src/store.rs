//! The `RemoteStore` trait: the complete surface the sync core needs from
//! the backend — row CRUD, RPC, a subscribable change stream and a health
//! probe. All methods return `RemoteError` classified as transient or
//! permanent so the queue can decide whether to retry.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use convoy_core::types::{ChangeEvent, Record};
use convoy_core::RemoteError;

/// Row selector for deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMatch {
    pub key: String,
}

impl RecordMatch {
    pub fn key(key: impl Into<String>) -> Self {
        RecordMatch { key: key.into() }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert or update one row. Idempotent: repeating the same call leaves
    /// the table in the same state.
    async fn upsert(&self, table: &str, key: &str, payload: Value) -> Result<Record, RemoteError>;

    /// Delete matching rows. Deleting an absent row is not an error.
    async fn delete(&self, table: &str, matcher: &RecordMatch) -> Result<(), RemoteError>;

    /// Fetch the full table snapshot (used by the pull phase).
    async fn fetch_all(&self, table: &str) -> Result<Vec<Record>, RemoteError>;

    /// Invoke a server-side function (server-side merge/validation hooks).
    async fn rpc(&self, name: &str, args: Value) -> Result<Value, RemoteError>;

    /// Open one change-stream session covering `tables`. The caller owns the
    /// returned session exclusively.
    async fn subscribe_changes(&self, tables: &[String]) -> Result<ChangeSession, RemoteError>;

    /// Cheap connectivity probe.
    async fn health(&self) -> Result<(), RemoteError>;
}

/// An open change-stream session.
///
/// Events arrive on an internal channel; the stream ends (`next_event`
/// returns `None`) when the backend drops the session. `close` tears the
/// session down explicitly.
pub struct ChangeSession {
    events: mpsc::Receiver<ChangeEvent>,
    closer: Option<oneshot::Sender<()>>,
}

impl ChangeSession {
    pub fn new(events: mpsc::Receiver<ChangeEvent>, closer: oneshot::Sender<()>) -> Self {
        ChangeSession {
            events,
            closer: Some(closer),
        }
    }

    /// A session with no explicit close signal; closing is dropping the
    /// receiver (the memory backend prunes dead senders lazily).
    pub fn from_receiver(events: mpsc::Receiver<ChangeEvent>) -> Self {
        ChangeSession {
            events,
            closer: None,
        }
    }

    /// Next event, or `None` once the session has ended.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn close(mut self) {
        if let Some(tx) = self.closer.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ChangeSession {
    fn drop(&mut self) {
        if let Some(tx) = self.closer.take() {
            let _ = tx.send(());
        }
    }
}
