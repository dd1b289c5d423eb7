//! Connectivity signal. The monitor is fed transitions by the embedder
//! (convoyd runs a health probe; app clients bridge their platform network
//! APIs) and notifies watchers only when the state actually changes — the
//! core never polls steady state.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        NetworkMonitor { tx: Arc::new(tx) }
    }

    /// Record the current connectivity. Watchers are notified on transitions
    /// only; repeated reports of the same state are dropped.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
        if changed {
            info!(online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver for transition-driven consumers (e.g. drain-on-reconnect).
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        NetworkMonitor::new(true)
    }
}
