//! Durable key/value persistence — the contract the queue and coordinator
//! store their state through.
//!
//! Two backends:
//!   - **JsonFileStore**: one JSON map on disk, every mutation written
//!     through atomically (temp + rename), so restarts resume pending work.
//!   - **MemoryStore**: tests.
//!
//! `get` may legitimately return `None`; every method may fail.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use convoy_core::{ConvoyError, ConvoyResult};

pub trait PersistentStore: Send + Sync {
    fn get(&self, key: &str) -> ConvoyResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> ConvoyResult<()>;
    fn remove(&self, key: &str) -> ConvoyResult<()>;
}

// ── JSON file backend ─────────────────────────────────────────────────────────

/// Single-file JSON store with write-through persistence.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Load or create a store at the given path. A missing file starts empty.
    pub fn open(path: &Path) -> ConvoyResult<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| {
                ConvoyError::Persist(format!("parsing {}: {e}", path.display()))
            })?
        } else {
            HashMap::new()
        };

        Ok(JsonFileStore {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    /// Atomic write: temp file then rename.
    fn flush(&self, entries: &HashMap<String, String>) -> ConvoyResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| ConvoyError::Persist(format!("serializing store: {e}")))?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl PersistentStore for JsonFileStore {
    fn get(&self, key: &str) -> ConvoyResult<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> ConvoyResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> ConvoyResult<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

// ── Memory backend ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &str) -> ConvoyResult<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> ConvoyResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> ConvoyResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_nonexistent_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(&dir.path().join("state.json")).unwrap();
        assert!(store.get("anything").unwrap().is_none());
    }

    #[test]
    fn set_get_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set("sync/queue", "[]").unwrap();
        store.set("sync/last_sync", "2026-01-01T00:00:00Z").unwrap();

        // Reload and verify write-through persisted both keys
        let store2 = JsonFileStore::open(&path).unwrap();
        assert_eq!(store2.get("sync/queue").unwrap().as_deref(), Some("[]"));
        assert_eq!(
            store2.get("sync/last_sync").unwrap().as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
    }

    #[test]
    fn remove_deletes_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set("k", "v").unwrap();
        store.remove("k").unwrap();
        assert!(store.get("k").unwrap().is_none());

        let store2 = JsonFileStore::open(&path).unwrap();
        assert!(store2.get("k").unwrap().is_none());
    }

    #[test]
    fn remove_missing_key_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(&dir.path().join("state.json")).unwrap();
        store.remove("ghost").unwrap();
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();

        let err = JsonFileStore::open(&path).unwrap_err();
        assert!(matches!(err, ConvoyError::Persist(_)));
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        store.remove("a").unwrap();
        assert!(store.get("a").unwrap().is_none());
    }
}
