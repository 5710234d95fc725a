use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LoamError;
use crate::types::ids::EventId;

/// A named, ordered intent to change the materialized store.
///
/// Immutable once created. `schema_hash` pins the event to the shape of its
/// mutation definition at authoring time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    pub id: EventId,
    pub mutation: String,
    pub args: serde_json::Value,
    pub schema_hash: i64,
}

impl MutationEvent {
    pub fn new(id: EventId, mutation: impl Into<String>, args: serde_json::Value, schema_hash: i64) -> Self {
        Self {
            id,
            mutation: mutation.into(),
            args,
            schema_hash,
        }
    }
}

/// Sync state of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    /// Declared local-only: never pushed, never moves the cursor
    LocalOnly,
    /// Committed locally, not yet confirmed by the remote authority
    Pending,
    /// Confirmed by (or received from) the remote authority
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::LocalOnly => "localOnly",
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = LoamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "localOnly" => Ok(SyncStatus::LocalOnly),
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            other => Err(LoamError::InvalidArgs(format!("unknown sync status '{}'", other))),
        }
    }
}

/// Where a batch handed to the apply pipeline came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    /// Authored in this storage location (directly or forwarded by a sibling)
    Local,
    /// Pulled from, or pushed live by, the remote authority
    Remote,
    /// Relayed by the cross-context broadcaster
    Broadcast,
}

impl Origin {
    /// Initial sync status for an event of this origin
    pub fn initial_status(&self, local_only: bool) -> SyncStatus {
        if local_only {
            return SyncStatus::LocalOnly;
        }
        match self {
            Origin::Remote => SyncStatus::Synced,
            Origin::Local | Origin::Broadcast => SyncStatus::Pending,
        }
    }
}

/// A mutation event as delivered by the remote authority.
///
/// `persisted` is false for events the remote relays without keeping; the
/// flag is copied onto the log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEvent {
    pub event: MutationEvent,
    pub persisted: bool,
}

impl RemoteEvent {
    pub fn new(event: MutationEvent) -> Self {
        Self {
            event,
            persisted: true,
        }
    }

    pub fn transient(event: MutationEvent) -> Self {
        Self {
            event,
            persisted: false,
        }
    }

    pub fn id(&self) -> &EventId {
        &self.event.id
    }
}

impl From<MutationEvent> for RemoteEvent {
    fn from(event: MutationEvent) -> Self {
        Self::new(event)
    }
}

/// A durably stored mutation event plus its sync status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(flatten)]
    pub event: MutationEvent,
    pub sync_status: SyncStatus,
    /// RFC 3339 commit time
    pub created_at: String,
    pub persisted: bool,
}

impl LogEntry {
    pub fn id(&self) -> &EventId {
        &self.event.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ids::OriginId;

    #[test]
    fn test_sync_status_roundtrip_strings() {
        for status in [SyncStatus::LocalOnly, SyncStatus::Pending, SyncStatus::Synced] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_initial_status_by_origin() {
        assert_eq!(Origin::Local.initial_status(false), SyncStatus::Pending);
        assert_eq!(Origin::Remote.initial_status(false), SyncStatus::Synced);
        assert_eq!(Origin::Remote.initial_status(true), SyncStatus::LocalOnly);
        assert_eq!(Origin::Local.initial_status(true), SyncStatus::LocalOnly);
    }

    #[test]
    fn test_mutation_event_json_shape() {
        let id = EventId::new(1, 0, OriginId::from_bytes([1; 8]));
        let event = MutationEvent::new(id, "addTodo", serde_json::json!({"id": "t1"}), 42);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["mutation"], "addTodo");
        assert_eq!(value["schemaHash"], 42);
        assert_eq!(value["id"], id.to_string());
    }
}
