//! Messages exchanged between execution contexts sharing a storage location

use std::collections::BTreeSet;

use libloam_core::{ContextId, ExecutionItem, LogEntry, MutationEvent, SyncStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// One committed item, in commit order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CommittedItem {
    #[serde(rename_all = "camelCase")]
    Event {
        event: MutationEvent,
        sync_status: SyncStatus,
    },
    Execute {
        sql: String,
        bind: Value,
        tables: BTreeSet<String>,
    },
}

impl CommittedItem {
    pub fn from_entry(entry: &LogEntry) -> Self {
        CommittedItem::Event {
            event: entry.event.clone(),
            sync_status: entry.sync_status,
        }
    }

    /// The raw statements of a batch are not logged, so they are rebuilt
    /// from the submitted items
    pub fn from_execute(item: &ExecutionItem) -> Option<Self> {
        match item {
            ExecutionItem::Execute { sql, bind, tables } => Some(CommittedItem::Execute {
                sql: sql.clone(),
                bind: bind.clone(),
                tables: tables.clone(),
            }),
            ExecutionItem::Mutate { .. } => None,
        }
    }

    pub fn event(&self) -> Option<&MutationEvent> {
        match self {
            CommittedItem::Event { event, .. } => Some(event),
            CommittedItem::Execute { .. } => None,
        }
    }
}

/// Messages fanned out to every sibling context on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    /// A batch committed by the leader
    Committed {
        sender: ContextId,
        /// Leader commit sequence, strictly increasing per leader
        seq: u64,
        items: Vec<CommittedItem>,
        tables: BTreeSet<String>,
    },
    /// A context took the lease
    LeaderElected { leader: ContextId },
    /// The leader gave up the lease
    LeaderReleased { leader: ContextId },
}

impl BroadcastMessage {
    pub fn notification_type(&self) -> &'static str {
        match self {
            BroadcastMessage::Committed { .. } => "committed",
            BroadcastMessage::LeaderElected { .. } => "leader_elected",
            BroadcastMessage::LeaderReleased { .. } => "leader_released",
        }
    }

    /// The context that published this message
    pub fn sender(&self) -> ContextId {
        match self {
            BroadcastMessage::Committed { sender, .. } => *sender,
            BroadcastMessage::LeaderElected { leader } => *leader,
            BroadcastMessage::LeaderReleased { leader } => *leader,
        }
    }

    pub fn committed(
        sender: ContextId,
        seq: u64,
        items: Vec<CommittedItem>,
        tables: BTreeSet<String>,
    ) -> Self {
        BroadcastMessage::Committed {
            sender,
            seq,
            items,
            tables,
        }
    }
}

/// Application-store snapshot served by the leader to bootstrapping followers
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub leader: ContextId,
    /// Commit sequence the snapshot includes
    pub seq: u64,
    pub app_bytes: Vec<u8>,
}

/// Commit position of a forwarded batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub leader: ContextId,
    /// Commit sequence after the batch; followers have it once they reach it
    pub seq: u64,
}

/// Why the leader refused a forwarded batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: String,
    pub message: String,
    pub fatal: bool,
}

/// Requests addressed to the leader only
#[derive(Debug)]
pub enum LeaderRequest {
    Snapshot {
        reply: oneshot::Sender<Result<Snapshot, Rejection>>,
    },
    Forward {
        sender: ContextId,
        items: Vec<ExecutionItem>,
        reply: oneshot::Sender<Result<Ack, Rejection>>,
    },
}
