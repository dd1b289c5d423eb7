use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from convoy.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvoyConfig {
    pub daemon: DaemonConfig,
    pub remote: RemoteConfig,
    pub persist: PersistConfig,
    pub sync: SyncConfig,
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP listen address for status/health/metrics (default: 127.0.0.1:7450)
    pub listen: String,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Backend: "rest" or "memory" (loopback, development only)
    pub backend: String,
    /// REST base URL
    pub base_url: String,
    /// API key sent as a bearer token (REST backend)
    pub api_key: Option<String>,
    /// Fixed per-call timeout in seconds
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Durable key/value store path (single JSON file)
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum pending changes before the oldest is evicted
    pub queue_capacity: usize,
    /// Transient-failure retries per change before it is reported as failed
    pub max_retries: u32,
    /// Base backoff delay in milliseconds (doubles per retry)
    pub retry_base_ms: u64,
    /// Backoff ceiling in milliseconds
    pub retry_cap_ms: u64,
    /// Equal-timestamp merge tie-break: "remote" or "local"
    pub tie_break: String,
    /// Periodic full-sync interval in seconds (0 disables)
    pub auto_sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Duplicate-event suppression window in milliseconds
    pub debounce_ms: u64,
    /// Fixed delay before the single reconnect attempt, in milliseconds
    pub reconnect_delay_ms: u64,
    /// Recent-event map size that triggers pruning
    pub recent_events_cap: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7450".into(),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: "rest".into(),
            base_url: "http://localhost:8000".into(),
            api_key: None,
            timeout_secs: 10,
        }
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.local/share/convoy/state.json"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            max_retries: 3,
            retry_base_ms: 2000,
            retry_cap_ms: 60_000,
            tie_break: "remote".into(),
            auto_sync_interval_secs: 600,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            reconnect_delay_ms: 2000,
            recent_events_cap: 100,
        }
    }
}
