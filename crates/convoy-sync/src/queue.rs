//! Bounded, persisted FIFO log of pending local mutations.
//!
//! Every mutation is written through to the persistent store immediately, so
//! an app restart resumes pending work. Over capacity the oldest entry is
//! evicted with an explicit log line — losing data here is deliberate and
//! visible, never a silent corruption. Drain is single-flight and refuses to
//! run while the network monitor reports offline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use convoy_core::config::SyncConfig;
use convoy_core::types::{ChangeOp, EntityKind, SyncChange};
use convoy_core::{ConvoyError, ConvoyResult, RemoteError};
use convoy_remote::{RecordMatch, RemoteStore};

use crate::monitor::NetworkMonitor;
use crate::persist::PersistentStore;

/// Persisted queue key — owned exclusively by this component.
pub const QUEUE_KEY: &str = "sync/queue";

/// A change that was dropped after exhausting retries (or on a permanent
/// rejection). Reported, never silently discarded.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub change_id: Uuid,
    pub kind: EntityKind,
    pub entity_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueOutcome {
    pub succeeded: usize,
    pub failed: Vec<FailureReport>,
    pub retries_scheduled: usize,
}

pub struct SyncQueue {
    store: Arc<dyn PersistentStore>,
    remote: Arc<dyn RemoteStore>,
    monitor: NetworkMonitor,
    entries: Mutex<VecDeque<SyncChange>>,
    draining: AtomicBool,
    capacity: usize,
    max_retries: u32,
    retry_base: Duration,
    retry_cap: Duration,
}

impl SyncQueue {
    /// Open the queue, restoring any entries persisted by a previous run.
    pub fn open(
        store: Arc<dyn PersistentStore>,
        remote: Arc<dyn RemoteStore>,
        monitor: NetworkMonitor,
        config: &SyncConfig,
    ) -> ConvoyResult<Self> {
        let entries: VecDeque<SyncChange> = match store.get(QUEUE_KEY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| ConvoyError::Persist(format!("parsing persisted queue: {e}")))?,
            None => VecDeque::new(),
        };

        if !entries.is_empty() {
            info!(pending = entries.len(), "sync queue restored");
        }

        Ok(SyncQueue {
            store,
            remote,
            monitor,
            entries: Mutex::new(entries),
            draining: AtomicBool::new(false),
            capacity: config.queue_capacity,
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
            retry_cap: Duration::from_millis(config.retry_cap_ms),
        })
    }

    /// Append a change. Over capacity the oldest entry is evicted and logged.
    pub async fn enqueue(&self, change: SyncChange) -> ConvoyResult<()> {
        let mut entries = self.entries.lock().await;
        debug!(change = %change.id, entity = %change.entity_id, op = ?change.op, "enqueued");
        entries.push_back(change);

        while entries.len() > self.capacity {
            if let Some(evicted) = entries.pop_front() {
                warn!(
                    change = %evicted.id,
                    entity = %evicted.entity_id,
                    capacity = self.capacity,
                    "queue over capacity, evicting oldest change"
                );
            }
        }

        self.persist(&entries)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Current entries, oldest first (status/inspection).
    pub async fn pending(&self) -> Vec<SyncChange> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Drain pending changes to the remote store in enqueue order.
    ///
    /// Single-flight: a call while another drain runs is a no-op returning an
    /// empty outcome. Refuses to run offline.
    pub async fn drain(&self) -> ConvoyResult<QueueOutcome> {
        if !self.monitor.is_online() {
            return Err(ConvoyError::Offline);
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in progress");
            return Ok(QueueOutcome::default());
        }

        let outcome = self.drain_inner().await;
        self.draining.store(false, Ordering::SeqCst);
        outcome
    }

    async fn drain_inner(&self) -> ConvoyResult<QueueOutcome> {
        let mut outcome = QueueOutcome::default();
        let planned = self.entries.lock().await.len();
        let mut index = 0usize;

        for _ in 0..planned {
            if !self.monitor.is_online() {
                info!("connectivity lost mid-drain, leaving remaining entries queued");
                break;
            }

            // Entries enqueued concurrently land behind `planned` and wait
            // for the next drain; removal only ever happens at `index`.
            let change = match self.entries.lock().await.get(index) {
                Some(change) => change.clone(),
                None => break,
            };

            if let Some(not_before) = change.not_before {
                if not_before > Utc::now() {
                    outcome.retries_scheduled += 1;
                    index += 1;
                    continue;
                }
            }

            match self.send(&change).await {
                Ok(()) => {
                    let mut entries = self.entries.lock().await;
                    entries.remove(index);
                    self.persist(&entries)?;
                    outcome.succeeded += 1;
                    debug!(change = %change.id, entity = %change.entity_id, "change applied remotely");
                }
                Err(err) if err.is_transient() => {
                    let mut entries = self.entries.lock().await;
                    if let Some(entry) = entries.get_mut(index) {
                        entry.retry_count += 1;
                        if entry.retry_count >= self.max_retries {
                            if let Some(dropped) = entries.remove(index) {
                                error!(
                                    change = %dropped.id,
                                    entity = %dropped.entity_id,
                                    retries = dropped.retry_count,
                                    "change permanently failed after retries: {err}"
                                );
                                outcome.failed.push(FailureReport {
                                    change_id: dropped.id,
                                    kind: dropped.kind,
                                    entity_id: dropped.entity_id,
                                    error: err.to_string(),
                                });
                            }
                        } else {
                            let delay = self.backoff(entry.retry_count);
                            entry.not_before = Some(Utc::now() + delay);
                            warn!(
                                change = %entry.id,
                                retry = entry.retry_count,
                                delay_ms = delay.num_milliseconds(),
                                "transient failure, retry scheduled: {err}"
                            );
                            outcome.retries_scheduled += 1;
                            index += 1;
                        }
                    }
                    self.persist(&entries)?;
                }
                Err(err) => {
                    // Permanent rejection: retrying cannot help.
                    let mut entries = self.entries.lock().await;
                    if let Some(dropped) = entries.remove(index) {
                        error!(
                            change = %dropped.id,
                            entity = %dropped.entity_id,
                            "change rejected by remote: {err}"
                        );
                        outcome.failed.push(FailureReport {
                            change_id: dropped.id,
                            kind: dropped.kind,
                            entity_id: dropped.entity_id,
                            error: err.to_string(),
                        });
                    }
                    self.persist(&entries)?;
                }
            }
        }

        Ok(outcome)
    }

    async fn send(&self, change: &SyncChange) -> Result<(), RemoteError> {
        match change.op {
            ChangeOp::Upsert => self
                .remote
                .upsert(
                    change.kind.table(),
                    &change.entity_id,
                    change.payload.clone(),
                )
                .await
                .map(|_| ()),
            ChangeOp::Delete => {
                self.remote
                    .delete(change.kind.table(), &RecordMatch::key(&change.entity_id))
                    .await
            }
        }
    }

    /// Exponential backoff with jitter, capped.
    fn backoff(&self, retry_count: u32) -> ChronoDuration {
        let exp = retry_count.saturating_sub(1).min(16);
        let base_ms = self.retry_base.as_millis() as u64;
        let cap_ms = self.retry_cap.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exp).min(cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=delay_ms / 10 + 1);
        ChronoDuration::milliseconds((delay_ms + jitter) as i64)
    }

    fn persist(&self, entries: &VecDeque<SyncChange>) -> ConvoyResult<()> {
        let raw = serde_json::to_string(entries)
            .map_err(|e| ConvoyError::Persist(format!("serializing queue: {e}")))?;
        self.store.set(QUEUE_KEY, &raw)
    }
}
