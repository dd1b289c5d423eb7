//! HTTP surface: Prometheus metrics, health probes and sync status.
//!
//! Endpoints:
//!   GET /metrics  — Prometheus text format
//!   GET /healthz  — liveness (200 while the process runs)
//!   GET /readyz   — readiness (200 if the remote backend is reachable)
//!   GET /status   — JSON sync status (lazily initializes the coordinator)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus_client::{
    encoding::text::encode, metrics::counter::Counter, registry::Registry,
};
use std::sync::{Arc, Mutex};

use convoy_remote::RemoteStore;
use convoy_sync::coordinator::SyncReport;
use convoy_sync::{NetworkMonitor, ServiceRegistry, SyncCoordinator};

pub struct DaemonMetrics {
    registry: Mutex<Registry>,
    sync_runs: Counter,
    changes_pushed: Counter,
    push_failures: Counter,
    pull_errors: Counter,
}

impl DaemonMetrics {
    pub fn new() -> Arc<Self> {
        let mut registry = Registry::default();

        let sync_runs = Counter::default();
        let changes_pushed = Counter::default();
        let push_failures = Counter::default();
        let pull_errors = Counter::default();

        registry.register(
            "convoy_sync_runs",
            "Completed sync runs",
            sync_runs.clone(),
        );
        registry.register(
            "convoy_changes_pushed",
            "Queued changes confirmed applied remotely",
            changes_pushed.clone(),
        );
        registry.register(
            "convoy_push_failures",
            "Changes dropped as permanently failed",
            push_failures.clone(),
        );
        registry.register(
            "convoy_pull_errors",
            "Per-table or per-record pull errors",
            pull_errors.clone(),
        );

        Arc::new(DaemonMetrics {
            registry: Mutex::new(registry),
            sync_runs,
            changes_pushed,
            push_failures,
            pull_errors,
        })
    }

    pub fn observe_sync(&self, report: &SyncReport) {
        self.sync_runs.inc();
        self.changes_pushed.inc_by(report.pushed.succeeded as u64);
        self.push_failures.inc_by(report.pushed.failed.len() as u64);
        self.pull_errors.inc_by(report.pulled.errors.len() as u64);
    }

    fn encode_text(&self) -> Result<String, std::fmt::Error> {
        let mut body = String::new();
        encode(&mut body, &self.registry.lock().unwrap())?;
        Ok(body)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: ServiceRegistry,
    pub monitor: NetworkMonitor,
    pub remote: Arc<dyn RemoteStore>,
    pub metrics: Arc<DaemonMetrics>,
}

pub async fn serve(addr: String, state: AppState) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("http bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "http: listening on /status, /metrics, /healthz, /readyz");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("http server: {e}"))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: 200 while the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: 200 if the monitor reports online and the remote
/// backend answers a live check.
async fn readyz_handler(State(state): State<AppState>) -> impl IntoResponse {
    if !state.monitor.is_online() {
        return (StatusCode::SERVICE_UNAVAILABLE, "offline");
    }
    match state.remote.health().await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "remote unreachable"),
    }
}

/// Sync status. This is a lazy accessor: the first hit initializes the
/// coordinator.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.registry.get_as::<SyncCoordinator>("coordinator").await {
        Ok(coordinator) => {
            let status = coordinator.status().await;
            (StatusCode::OK, Json(serde_json::json!(status))).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
