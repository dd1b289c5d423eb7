//! Domain types shared across the workspace: entity kinds, queued changes,
//! entity snapshots, remote records and change events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ConvoyError, ConvoyResult};

// ── Entity kinds ──────────────────────────────────────────────────────────────

/// The closed set of synchronized entity types.
///
/// Each kind maps 1:1 to a remote table and to a realtime topic of the same
/// name. Unknown table names fail fast instead of silently defaulting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Being,
    ReadingProgress,
    Achievement,
    Note,
    Bookmark,
    Settings,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Being,
        EntityKind::ReadingProgress,
        EntityKind::Achievement,
        EntityKind::Note,
        EntityKind::Bookmark,
        EntityKind::Settings,
    ];

    /// Remote table (and realtime topic) name for this kind.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Being => "beings",
            EntityKind::ReadingProgress => "reading_progress",
            EntityKind::Achievement => "achievements",
            EntityKind::Note => "notes",
            EntityKind::Bookmark => "bookmarks",
            EntityKind::Settings => "user_settings",
        }
    }

    pub fn from_table(table: &str) -> ConvoyResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.table() == table)
            .ok_or_else(|| ConvoyError::UnknownEntity(table.to_string()))
    }

    /// The full static topic list, in declaration order.
    pub fn topics() -> Vec<String> {
        Self::ALL.iter().map(|k| k.table().to_string()).collect()
    }
}

// ── Queued changes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Upsert,
    Delete,
}

/// A pending local mutation, persisted in the sync queue until confirmed
/// applied remotely or permanently failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChange {
    pub id: Uuid,
    pub kind: EntityKind,
    pub entity_id: String,
    pub payload: Value,
    pub op: ChangeOp,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Backoff deadline: the entry is skipped by drain until this passes.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

impl SyncChange {
    pub fn new(kind: EntityKind, entity_id: impl Into<String>, payload: Value, op: ChangeOp) -> Self {
        SyncChange {
            id: Uuid::new_v4(),
            kind,
            entity_id: entity_id.into(),
            payload,
            op,
            enqueued_at: Utc::now(),
            retry_count: 0,
            not_before: None,
        }
    }
}

// ── Entity snapshots ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Remote,
}

/// A transient, merge-ready view of one logical entity.
///
/// Produced by adapters from application state or remote payloads; never
/// persisted itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub kind: EntityKind,
    pub entity_id: String,
    pub fields: serde_json::Map<String, Value>,
    pub updated_at: DateTime<Utc>,
    pub origin: Origin,
}

impl EntitySnapshot {
    /// Build a remote-origin snapshot from a fetched record.
    pub fn from_record(kind: EntityKind, record: &Record) -> Self {
        let fields = match &record.payload {
            Value::Object(map) => map.clone(),
            other => {
                // Non-object payloads are wrapped so merge still has a field to work with.
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        EntitySnapshot {
            kind,
            entity_id: record.key.clone(),
            fields,
            updated_at: record.updated_at,
            origin: Origin::Remote,
        }
    }
}

// ── Remote records and change events ──────────────────────────────────────────

/// One row as stored by the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

/// A change notification delivered on the realtime stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub event_type: EventType,
    #[serde(default)]
    pub new_record: Option<Record>,
    #[serde(default)]
    pub old_record: Option<Record>,
}

impl ChangeEvent {
    /// The affected entity id, taken from whichever side the event carries.
    pub fn entity_id(&self) -> Option<&str> {
        self.new_record
            .as_ref()
            .or(self.old_record.as_ref())
            .map(|r| r.key.as_str())
    }
}

// ── Device identity and status ────────────────────────────────────────────────

/// Identifies this installation to the backend. Created lazily on the first
/// sync attempt; cleared only on logout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub user_id: String,
}

impl DeviceIdentity {
    pub fn generate(user_id: impl Into<String>) -> Self {
        DeviceIdentity {
            device_id: format!("device-{}", Uuid::new_v4()),
            user_id: user_id.into(),
        }
    }
}

/// Application-facing sync state summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub online: bool,
    pub syncing: bool,
    pub queue_length: usize,
    pub last_sync: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_kind_table_roundtrip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_table(kind.table()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_table_fails_fast() {
        let err = EntityKind::from_table("leaderboards").unwrap_err();
        assert!(matches!(err, ConvoyError::UnknownEntity(_)));
    }

    #[test]
    fn topics_cover_all_kinds() {
        let topics = EntityKind::topics();
        assert_eq!(topics.len(), EntityKind::ALL.len());
        assert!(topics.contains(&"user_settings".to_string()));
    }

    #[test]
    fn snapshot_from_object_record() {
        let record = Record {
            key: "being-1".into(),
            payload: json!({"level": 3, "xp": 120}),
            updated_at: Utc::now(),
        };
        let snap = EntitySnapshot::from_record(EntityKind::Being, &record);
        assert_eq!(snap.entity_id, "being-1");
        assert_eq!(snap.origin, Origin::Remote);
        assert_eq!(snap.fields["level"], json!(3));
    }

    #[test]
    fn snapshot_from_scalar_record_wraps_value() {
        let record = Record {
            key: "s-1".into(),
            payload: json!(42),
            updated_at: Utc::now(),
        };
        let snap = EntitySnapshot::from_record(EntityKind::Settings, &record);
        assert_eq!(snap.fields["value"], json!(42));
    }

    #[test]
    fn change_event_entity_id_prefers_new_record() {
        let record = |key: &str| Record {
            key: key.into(),
            payload: json!({}),
            updated_at: Utc::now(),
        };
        let event = ChangeEvent {
            table: "notes".into(),
            event_type: EventType::Update,
            new_record: Some(record("new")),
            old_record: Some(record("old")),
        };
        assert_eq!(event.entity_id(), Some("new"));

        let delete = ChangeEvent {
            table: "notes".into(),
            event_type: EventType::Delete,
            new_record: None,
            old_record: Some(record("old")),
        };
        assert_eq!(delete.entity_id(), Some("old"));
    }

    #[test]
    fn sync_change_serde_roundtrip() {
        let change = SyncChange::new(
            EntityKind::Note,
            "note-9",
            json!({"body": "hello"}),
            ChangeOp::Upsert,
        );
        let encoded = serde_json::to_string(&change).unwrap();
        let decoded: SyncChange = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, change.id);
        assert_eq!(decoded.entity_id, "note-9");
        assert_eq!(decoded.retry_count, 0);
        assert!(decoded.not_before.is_none());
    }
}
