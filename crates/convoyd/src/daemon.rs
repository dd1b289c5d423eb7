//! Daemon lifecycle: wiring, connectivity probe, drain-on-reconnect,
//! periodic full sync, graceful shutdown.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use convoy_core::config::ConvoyConfig;
use convoy_core::types::EntityKind;
use convoy_remote::{MemoryRemote, RemoteStore, RestRemote};
use convoy_sync::mux::Subscription;
use convoy_sync::persist::{JsonFileStore, PersistentStore};
use convoy_sync::{
    ChangeMultiplexer, MemoryLocalStore, NetworkMonitor, PolicyTable, ServiceRegistry,
    SyncCoordinator, TieBreak,
};

use crate::metrics::{self, AppState, DaemonMetrics};

const PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// The realtime service held in the registry: the multiplexer plus the
/// coordinator's topic subscriptions, kept alive for the daemon's lifetime.
pub struct RealtimeService {
    pub mux: ChangeMultiplexer,
    _subscriptions: Vec<Subscription>,
}

pub async fn run(config: ConvoyConfig, user_id: String) -> Result<()> {
    info!("daemon starting");

    let store = open_store(&config.persist.path)?;
    let remote = build_remote(&config)?;
    // Offline until the first probe passes; the queue refuses to drain
    // until then.
    let monitor = NetworkMonitor::new(false);
    let tie_break = TieBreak::parse(&config.sync.tie_break)?;

    // Service registry: registration is cheap; each service initializes on
    // its first real `get`.
    let registry = {
        let store = store.clone();
        let remote_for_coord = remote.clone();
        let remote_for_mux = remote.clone();
        let monitor = monitor.clone();
        let sync_cfg = config.sync.clone();
        let realtime_cfg = config.realtime.clone();

        ServiceRegistry::builder()
            .service("coordinator", &[], move |_| {
                let store = store.clone();
                let remote = remote_for_coord.clone();
                let monitor = monitor.clone();
                let sync_cfg = sync_cfg.clone();
                let user = user_id.clone();
                async move {
                    let coordinator = SyncCoordinator::new(
                        remote,
                        store,
                        Arc::new(MemoryLocalStore::new()),
                        monitor,
                        PolicyTable::product_defaults(tie_break),
                        user,
                        &sync_cfg,
                    )?;
                    info!("coordinator initialized");
                    Ok(Arc::new(coordinator))
                }
            })
            .service("realtime", &["coordinator"], move |registry| {
                let remote = remote_for_mux.clone();
                let realtime_cfg = realtime_cfg.clone();
                async move {
                    let coordinator = registry.get_as::<SyncCoordinator>("coordinator").await?;
                    let mux = ChangeMultiplexer::new(remote, EntityKind::topics(), &realtime_cfg);
                    let subscriptions = coordinator.attach(&mux).await?;
                    info!(topics = EntityKind::ALL.len(), "realtime multiplexer attached");
                    Ok(Arc::new(RealtimeService {
                        mux,
                        _subscriptions: subscriptions,
                    }))
                }
            })
            .build()?
    };
    registry.init_critical();

    let daemon_metrics = DaemonMetrics::new();

    // HTTP surface
    let http_state = AppState {
        registry: registry.clone(),
        monitor: monitor.clone(),
        remote: remote.clone(),
        metrics: daemon_metrics.clone(),
    };
    let listen = config.daemon.listen.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(listen, http_state).await {
            error!("http server failed: {e}");
        }
    });

    // Connectivity probe: the monitor emits on transitions only.
    {
        let remote = remote.clone();
        let monitor = monitor.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROBE_INTERVAL);
            loop {
                interval.tick().await;
                let online = remote.health().await.is_ok();
                monitor.set_online(online);
            }
        });
    }

    // Drain-on-reconnect: each offline→online transition triggers a full
    // sync and (the first time) brings the realtime service up.
    {
        let registry = registry.clone();
        let daemon_metrics = daemon_metrics.clone();
        let mut watcher = monitor.watch();
        tokio::spawn(async move {
            loop {
                if watcher.changed().await.is_err() {
                    break;
                }
                let online = *watcher.borrow_and_update();
                if !online {
                    info!("connectivity lost");
                    continue;
                }

                info!("connectivity restored, syncing");
                match registry.get_as::<SyncCoordinator>("coordinator").await {
                    Ok(coordinator) => {
                        let report = coordinator.sync().await;
                        daemon_metrics.observe_sync(&report);
                    }
                    Err(e) => error!("coordinator unavailable: {e}"),
                }
                if let Err(e) = registry.get_as::<RealtimeService>("realtime").await {
                    warn!("realtime unavailable: {e}");
                }
            }
        });
    }

    // Periodic full sync
    if config.sync.auto_sync_interval_secs > 0 {
        let registry = registry.clone();
        let monitor = monitor.clone();
        let daemon_metrics = daemon_metrics.clone();
        let period = Duration::from_secs(config.sync.auto_sync_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // skip the immediate first tick
            loop {
                interval.tick().await;
                if !monitor.is_online() {
                    continue;
                }
                match registry.get_as::<SyncCoordinator>("coordinator").await {
                    Ok(coordinator) => {
                        let report = coordinator.sync().await;
                        daemon_metrics.observe_sync(&report);
                    }
                    Err(e) => error!("coordinator unavailable: {e}"),
                }
            }
        });
        info!(
            interval_secs = config.sync.auto_sync_interval_secs,
            "auto-sync enabled"
        );
    }

    info!("convoyd ready");

    // Wait for shutdown
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    // Graceful teardown: one last drain attempt, then close the realtime
    // session. Only touch services that actually initialized.
    let states = registry.states().await;
    if states.get("coordinator") == Some(&"ready") {
        if let Ok(coordinator) = registry.get_as::<SyncCoordinator>("coordinator").await {
            match coordinator.queue().drain().await {
                Ok(outcome) => info!(pushed = outcome.succeeded, "final drain complete"),
                Err(e) => warn!("final drain skipped: {e}"),
            }
        }
    }
    if states.get("realtime") == Some(&"ready") {
        if let Ok(realtime) = registry.get_as::<RealtimeService>("realtime").await {
            realtime.mux.shutdown();
        }
    }

    info!("convoyd stopped");
    Ok(())
}

fn open_store(path: &Path) -> Result<Arc<dyn PersistentStore>> {
    let expanded = expand_home(path);
    match JsonFileStore::open(&expanded) {
        Ok(store) => {
            info!(path = %expanded.display(), "state store open");
            Ok(Arc::new(store))
        }
        Err(e) => {
            warn!("state store open failed: {e}  (starting fresh in temp dir)");
            let fallback = std::env::temp_dir().join("convoyd-state.json");
            Ok(Arc::new(
                JsonFileStore::open(&fallback).context("opening fallback state store")?,
            ))
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}

fn build_remote(config: &ConvoyConfig) -> Result<Arc<dyn RemoteStore>> {
    match config.remote.backend.as_str() {
        "rest" => {
            info!(base_url = %config.remote.base_url, "REST remote backend");
            Ok(Arc::new(RestRemote::new(&config.remote)?))
        }
        "memory" => {
            warn!("memory remote backend is a development loopback; remote state is not durable");
            Ok(Arc::new(MemoryRemote::new()))
        }
        other => anyhow::bail!("unknown remote backend: {other} (expected \"rest\" or \"memory\")"),
    }
}
