//! Adapter seam between the sync core and application state.
//!
//! The coordinator reads local counterparts through this trait before
//! merging and writes resolved entities back through it. Clients implement
//! it over their own stores; `MemoryLocalStore` backs tests and the daemon.

use std::collections::HashMap;
use std::sync::Mutex;

use convoy_core::types::{EntityKind, EntitySnapshot};
use convoy_core::ConvoyResult;

pub trait LocalStore: Send + Sync {
    fn get(&self, kind: EntityKind, entity_id: &str) -> Option<EntitySnapshot>;
    fn apply(&self, snapshot: &EntitySnapshot) -> ConvoyResult<()>;
    fn remove(&self, kind: EntityKind, entity_id: &str) -> ConvoyResult<()>;
}

#[derive(Default)]
pub struct MemoryLocalStore {
    entries: Mutex<HashMap<(EntityKind, String), EntitySnapshot>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        MemoryLocalStore::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, kind: EntityKind, entity_id: &str) -> Option<EntitySnapshot> {
        self.entries
            .lock()
            .unwrap()
            .get(&(kind, entity_id.to_string()))
            .cloned()
    }

    fn apply(&self, snapshot: &EntitySnapshot) -> ConvoyResult<()> {
        self.entries.lock().unwrap().insert(
            (snapshot.kind, snapshot.entity_id.clone()),
            snapshot.clone(),
        );
        Ok(())
    }

    fn remove(&self, kind: EntityKind, entity_id: &str) -> ConvoyResult<()> {
        self.entries
            .lock()
            .unwrap()
            .remove(&(kind, entity_id.to_string()));
        Ok(())
    }
}
