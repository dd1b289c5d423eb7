//! Push/pull orchestration.
//!
//! `sync()` is single-flight: concurrent callers share the one in-flight
//! run. Push drains the queue; pull fetches a full snapshot per entity kind
//! and adopts or merges each record into local state. The same merge path
//! handles realtime events from the multiplexer. One bad record never aborts
//! a batch, and `sync()` always returns a structured report — it never
//! propagates an error past its top level.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use convoy_core::config::SyncConfig;
use convoy_core::types::{
    ChangeEvent, ChangeOp, DeviceIdentity, EntityKind, EntitySnapshot, EventType, Record,
    SyncStatus,
};
use convoy_core::{ConvoyError, ConvoyResult};
use convoy_remote::RemoteStore;

use crate::local::LocalStore;
use crate::merge::PolicyTable;
use crate::monitor::NetworkMonitor;
use crate::mux::{ChangeMultiplexer, Subscription};
use crate::persist::PersistentStore;
use crate::queue::{QueueOutcome, SyncQueue};

/// Persisted keys owned by the coordinator.
pub const LAST_SYNC_KEY: &str = "sync/last_sync";
pub const IDENTITY_KEY: &str = "sync/device";

#[derive(Debug, Clone, Default, Serialize)]
pub struct PullOutcome {
    pub adopted: usize,
    pub merged: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub pushed: QueueOutcome,
    pub pulled: PullOutcome,
    /// Push/pull were skipped because the monitor reported offline.
    pub offline: bool,
    pub errors: Vec<String>,
}

enum Applied {
    Adopted,
    Merged,
}

type SyncFuture = Shared<BoxFuture<'static, SyncReport>>;

struct CoordInner {
    remote: Arc<dyn RemoteStore>,
    store: Arc<dyn PersistentStore>,
    local: Arc<dyn LocalStore>,
    monitor: NetworkMonitor,
    policies: PolicyTable,
    queue: Arc<SyncQueue>,
    user_id: String,
    syncing: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    identity: Mutex<Option<DeviceIdentity>>,
    in_flight: TokioMutex<Option<SyncFuture>>,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordInner>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn PersistentStore>,
        local: Arc<dyn LocalStore>,
        monitor: NetworkMonitor,
        policies: PolicyTable,
        user_id: impl Into<String>,
        config: &SyncConfig,
    ) -> ConvoyResult<Self> {
        let queue = Arc::new(SyncQueue::open(
            store.clone(),
            remote.clone(),
            monitor.clone(),
            config,
        )?);

        let last_sync = store
            .get(LAST_SYNC_KEY)?
            .and_then(|raw| raw.parse::<DateTime<Utc>>().ok());

        Ok(SyncCoordinator {
            inner: Arc::new(CoordInner {
                remote,
                store,
                local,
                monitor,
                policies,
                queue,
                user_id: user_id.into(),
                syncing: AtomicBool::new(false),
                last_sync: Mutex::new(last_sync),
                identity: Mutex::new(None),
                in_flight: TokioMutex::new(None),
            }),
        })
    }

    pub fn queue(&self) -> Arc<SyncQueue> {
        self.inner.queue.clone()
    }

    /// The single entry point by which local mutations become sync changes.
    ///
    /// The change is durably queued first, so continued offline use is
    /// always safe; when online a background drain is kicked off.
    pub async fn enqueue_change(
        &self,
        kind: EntityKind,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
        op: ChangeOp,
    ) -> ConvoyResult<()> {
        self.inner.ensure_identity()?;
        let change = convoy_core::types::SyncChange::new(kind, entity_id, payload, op);
        self.inner.queue.enqueue(change).await?;

        if self.inner.monitor.is_online() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                match inner.queue.drain().await {
                    Ok(_) | Err(ConvoyError::Offline) => {}
                    Err(e) => warn!("opportunistic drain failed: {e}"),
                }
            });
        }
        Ok(())
    }

    /// Run a full push + pull. Single-flight: concurrent callers await the
    /// one in-flight run and receive its report.
    pub async fn sync(&self) -> SyncReport {
        let fut = {
            let mut guard = self.inner.in_flight.lock().await;
            match guard.as_ref().filter(|f| f.peek().is_none()) {
                Some(existing) => {
                    debug!("sync already in flight, joining");
                    existing.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let fut: SyncFuture = async move { run_sync(inner).await }.boxed().shared();
                    *guard = Some(fut.clone());
                    fut
                }
            }
        };

        let report = fut.await;

        let mut guard = self.inner.in_flight.lock().await;
        if guard.as_ref().map(|f| f.peek().is_some()).unwrap_or(false) {
            *guard = None;
        }
        report
    }

    /// Register the coordinator's merge path on every topic.
    pub async fn attach(&self, mux: &ChangeMultiplexer) -> ConvoyResult<Vec<Subscription>> {
        let mut subscriptions = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            let inner = self.inner.clone();
            let sub = mux
                .subscribe(kind.table(), move |event| inner.handle_event(kind, event))
                .await?;
            subscriptions.push(sub);
        }
        Ok(subscriptions)
    }

    pub async fn status(&self) -> SyncStatus {
        SyncStatus {
            online: self.inner.monitor.is_online(),
            syncing: self.inner.syncing.load(Ordering::SeqCst),
            queue_length: self.inner.queue.len().await,
            last_sync: *self.inner.last_sync.lock().unwrap(),
        }
    }

    pub fn device_identity(&self) -> Option<DeviceIdentity> {
        self.inner.identity.lock().unwrap().clone()
    }

    /// Forget the device identity (logout). The next sync attempt creates a
    /// fresh one.
    pub fn logout(&self) -> ConvoyResult<()> {
        self.inner.store.remove(IDENTITY_KEY)?;
        *self.inner.identity.lock().unwrap() = None;
        info!("device identity cleared");
        Ok(())
    }
}

impl CoordInner {
    /// Load or lazily create the device identity.
    fn ensure_identity(&self) -> ConvoyResult<DeviceIdentity> {
        let mut guard = self.identity.lock().unwrap();
        if let Some(identity) = guard.as_ref() {
            return Ok(identity.clone());
        }

        let identity = match self.store.get(IDENTITY_KEY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| ConvoyError::Persist(format!("parsing device identity: {e}")))?,
            None => {
                let identity = DeviceIdentity::generate(&self.user_id);
                let raw = serde_json::to_string(&identity)
                    .map_err(|e| ConvoyError::Persist(format!("serializing identity: {e}")))?;
                self.store.set(IDENTITY_KEY, &raw)?;
                info!(device = %identity.device_id, user = %identity.user_id, "device identity created");
                identity
            }
        };

        *guard = Some(identity.clone());
        Ok(identity)
    }

    /// Adopt a remote record directly, or merge it with the local
    /// counterpart and apply the winner.
    fn apply_remote_record(&self, kind: EntityKind, record: &Record) -> ConvoyResult<Applied> {
        let remote_snap = EntitySnapshot::from_record(kind, record);
        match self.local.get(kind, &record.key) {
            None => {
                self.local.apply(&remote_snap)?;
                Ok(Applied::Adopted)
            }
            Some(local_snap) => {
                let merged = self.policies.merge(&local_snap, &remote_snap);
                self.local.apply(&merged)?;
                Ok(Applied::Merged)
            }
        }
    }

    /// Realtime events share the pull path's merge semantics.
    fn handle_event(&self, kind: EntityKind, event: &ChangeEvent) {
        match event.event_type {
            EventType::Delete => {
                if let Some(old) = &event.old_record {
                    if let Err(e) = self.local.remove(kind, &old.key) {
                        warn!(table = %event.table, key = %old.key, "remote delete apply failed: {e}");
                    }
                }
            }
            EventType::Insert | EventType::Update => {
                if let Some(record) = &event.new_record {
                    if let Err(e) = self.apply_remote_record(kind, record) {
                        warn!(table = %event.table, key = %record.key, "remote event apply failed: {e}");
                    }
                }
            }
        }
    }
}

async fn run_sync(inner: Arc<CoordInner>) -> SyncReport {
    inner.syncing.store(true, Ordering::SeqCst);
    let mut report = SyncReport::default();

    if let Err(e) = inner.ensure_identity() {
        warn!("device identity unavailable: {e}");
        report.errors.push(format!("identity: {e}"));
    }

    // Push phase
    match inner.queue.drain().await {
        Ok(outcome) => report.pushed = outcome,
        Err(ConvoyError::Offline) => {
            info!("sync: offline, push and pull deferred");
            report.offline = true;
        }
        Err(e) => {
            warn!("push failed: {e}");
            report.errors.push(format!("push: {e}"));
        }
    }

    // Pull phase — per-kind isolation: an unreachable table is summarized,
    // a bad record is skipped, and neither aborts the batch.
    if !report.offline {
        for kind in EntityKind::ALL {
            match inner.remote.fetch_all(kind.table()).await {
                Ok(records) => {
                    for record in records {
                        match inner.apply_remote_record(kind, &record) {
                            Ok(Applied::Adopted) => report.pulled.adopted += 1,
                            Ok(Applied::Merged) => report.pulled.merged += 1,
                            Err(e) => {
                                warn!(table = kind.table(), key = %record.key, "pull apply failed: {e}");
                                report
                                    .pulled
                                    .errors
                                    .push(format!("{}/{}: {e}", kind.table(), record.key));
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(table = kind.table(), "pull fetch failed: {e}");
                    report.pulled.errors.push(format!("{}: {e}", kind.table()));
                }
            }
        }

        let now = Utc::now();
        *inner.last_sync.lock().unwrap() = Some(now);
        if let Err(e) = inner.store.set(LAST_SYNC_KEY, &now.to_rfc3339()) {
            warn!("persisting last-sync timestamp failed: {e}");
            report.errors.push(format!("last_sync: {e}"));
        }
    }

    inner.syncing.store(false, Ordering::SeqCst);
    info!(
        pushed = report.pushed.succeeded,
        push_failed = report.pushed.failed.len(),
        adopted = report.pulled.adopted,
        merged = report.pulled.merged,
        offline = report.offline,
        "sync complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryLocalStore;
    use crate::merge::TieBreak;
    use crate::persist::MemoryStore;
    use convoy_remote::MemoryRemote;
    use serde_json::json;

    fn coordinator_over(
        remote: &MemoryRemote,
        online: bool,
    ) -> (SyncCoordinator, Arc<MemoryLocalStore>, NetworkMonitor) {
        let local = Arc::new(MemoryLocalStore::new());
        let monitor = NetworkMonitor::new(online);
        let coordinator = SyncCoordinator::new(
            Arc::new(remote.clone()),
            Arc::new(MemoryStore::new()),
            local.clone(),
            monitor.clone(),
            PolicyTable::product_defaults(TieBreak::Remote),
            "user-1",
            &SyncConfig::default(),
        )
        .unwrap();
        (coordinator, local, monitor)
    }

    #[tokio::test]
    async fn pull_adopts_unknown_records() {
        let remote = MemoryRemote::new();
        remote.seed(
            "beings",
            Record {
                key: "b1".into(),
                payload: json!({"level": 2}),
                updated_at: Utc::now(),
            },
        );

        let (coordinator, local, _monitor) = coordinator_over(&remote, true);
        let report = coordinator.sync().await;

        assert_eq!(report.pulled.adopted, 1);
        assert_eq!(report.pulled.merged, 0);
        let snap = local.get(EntityKind::Being, "b1").unwrap();
        assert_eq!(snap.fields["level"], json!(2));
    }

    #[tokio::test]
    async fn pull_merges_existing_records() {
        let remote = MemoryRemote::new();
        remote
            .upsert("beings", "b1", json!({"xp": 150, "traits": ["veteran"]}))
            .await
            .unwrap();

        let (coordinator, local, _monitor) = coordinator_over(&remote, true);
        // Pre-existing local counterpart with lower xp and a different trait.
        let fields = match json!({"xp": 120, "traits": ["novice"]}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        local
            .apply(&EntitySnapshot {
                kind: EntityKind::Being,
                entity_id: "b1".into(),
                fields,
                updated_at: Utc::now() - chrono::Duration::seconds(60),
                origin: convoy_core::types::Origin::Local,
            })
            .unwrap();

        let report = coordinator.sync().await;
        assert_eq!(report.pulled.merged, 1);

        let snap = local.get(EntityKind::Being, "b1").unwrap();
        assert_eq!(snap.fields["xp"], json!(150));
        let traits = snap.fields["traits"].as_array().unwrap();
        assert!(traits.contains(&json!("novice")));
        assert!(traits.contains(&json!("veteran")));
    }

    #[tokio::test]
    async fn offline_sync_reports_and_keeps_queue() {
        let remote = MemoryRemote::new();
        let (coordinator, _local, _monitor) = coordinator_over(&remote, false);
        coordinator
            .enqueue_change(EntityKind::Note, "n1", json!({"body": "x"}), ChangeOp::Upsert)
            .await
            .unwrap();

        let report = coordinator.sync().await;
        assert!(report.offline);
        assert_eq!(report.pushed.succeeded, 0);
        assert_eq!(coordinator.status().await.queue_length, 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_summarized_not_fatal() {
        let remote = MemoryRemote::new();
        remote.upsert("beings", "b1", json!({})).await.unwrap();
        let (coordinator, _local, _monitor) = coordinator_over(&remote, true);

        // First fetch (beings) fails; the remaining kinds still pull.
        remote.inject_failure(convoy_core::RemoteError::transient("flaky table"));
        let report = coordinator.sync().await;

        assert_eq!(report.pulled.errors.len(), 1);
        assert!(report.pulled.errors[0].starts_with("beings:"));
    }

    #[tokio::test]
    async fn identity_created_lazily_and_cleared_on_logout() {
        let remote = MemoryRemote::new();
        let (coordinator, _local, _monitor) = coordinator_over(&remote, true);
        assert!(coordinator.device_identity().is_none());

        coordinator
            .enqueue_change(EntityKind::Note, "n1", json!({}), ChangeOp::Upsert)
            .await
            .unwrap();
        let identity = coordinator.device_identity().unwrap();
        assert_eq!(identity.user_id, "user-1");

        coordinator.logout().unwrap();
        assert!(coordinator.device_identity().is_none());
    }

    #[tokio::test]
    async fn status_reflects_monitor_and_queue() {
        let remote = MemoryRemote::new();
        let (coordinator, _local, monitor) = coordinator_over(&remote, false);

        coordinator
            .enqueue_change(EntityKind::Note, "n1", json!({}), ChangeOp::Upsert)
            .await
            .unwrap();

        let status = coordinator.status().await;
        assert!(!status.online);
        assert_eq!(status.queue_length, 1);
        assert!(status.last_sync.is_none());

        monitor.set_online(true);
        let report = coordinator.sync().await;
        assert_eq!(report.pushed.succeeded, 1);

        let status = coordinator.status().await;
        assert!(status.online);
        assert_eq!(status.queue_length, 0);
        assert!(status.last_sync.is_some());
    }

    #[tokio::test]
    async fn realtime_event_applies_through_merge_path() {
        let remote = MemoryRemote::new();
        let (coordinator, local, _monitor) = coordinator_over(&remote, true);
        let mux = ChangeMultiplexer::new(
            Arc::new(remote.clone()),
            EntityKind::topics(),
            &convoy_core::config::RealtimeConfig::default(),
        );
        let _subs = coordinator.attach(&mux).await.unwrap();

        remote
            .upsert("notes", "n1", json!({"body": "from cloud"}))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let snap = local.get(EntityKind::Note, "n1").unwrap();
        assert_eq!(snap.fields["body"], json!("from cloud"));
    }
}
