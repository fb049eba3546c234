//! Durable replication records: push-queue entries, pull checkpoints and
//! the shape of changes coming back from the remote.

use crate::{CollectionName, Item, ItemId, Timestamp};
use serde::{Deserialize, Serialize};

/// Kind of mutation a queue entry carries to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueAction {
    Create,
    Update,
    Delete,
}

impl QueueAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueAction::Create => "create",
            QueueAction::Update => "update",
            QueueAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(QueueAction::Create),
            "update" => Some(QueueAction::Update),
            "delete" => Some(QueueAction::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Failed,
    Completed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Failed => "failed",
            QueueStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "failed" => Some(QueueStatus::Failed),
            "completed" => Some(QueueStatus::Completed),
            _ => None,
        }
    }
}

/// A file attachment that has to be uploaded before the entry is pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAttachment {
    pub field: String,
    pub file_id: String,
}

/// One pending local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: String,
    /// Position in the queue; entries are processed in ascending order.
    pub seq: u64,
    pub item_id: ItemId,
    pub collection: CollectionName,
    pub action: QueueAction,
    /// The item as it was when the mutation happened
    pub snapshot: Item,
    pub enqueued_at: Timestamp,
    pub attempts: u32,
    pub last_attempt_at: Option<Timestamp>,
    pub status: QueueStatus,
    pub last_error: Option<String>,
    #[serde(default)]
    pub pending_attachments: Vec<PendingAttachment>,
}

impl QueueEntry {
    /// A fresh pending entry. `seq` is assigned by the store on append.
    pub fn new(
        id: impl Into<String>,
        action: QueueAction,
        snapshot: Item,
        pending_attachments: Vec<PendingAttachment>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            seq: 0,
            item_id: snapshot.id.clone(),
            collection: snapshot.collection.clone(),
            action,
            snapshot,
            enqueued_at: now,
            attempts: 0,
            last_attempt_at: None,
            status: QueueStatus::Pending,
            last_error: None,
            pending_attachments,
        }
    }

    /// Entries in any state but `Completed` are due. A `Processing` entry
    /// found at the start of a pass was interrupted and is retried.
    pub fn is_due(&self) -> bool {
        self.status != QueueStatus::Completed
    }

    pub fn mark_processing(&mut self, now: Timestamp) {
        self.status = QueueStatus::Processing;
        self.last_attempt_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: Timestamp) {
        self.status = QueueStatus::Failed;
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.last_error = Some(error.into());
    }

    pub fn mark_completed(&mut self) {
        self.status = QueueStatus::Completed;
        self.last_error = None;
    }
}

/// Per-collection pull cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub collection: CollectionName,
    /// Largest remote `updatedAt` applied so far; `None` before the first
    /// pull. Pulls are inclusive of this value.
    pub last_pulled_at: Option<Timestamp>,
}

impl Checkpoint {
    pub fn new(collection: impl Into<CollectionName>) -> Self {
        Self {
            collection: collection.into(),
            last_pulled_at: None,
        }
    }

    /// True if a change stamped `updated_at` is not older than the cursor.
    pub fn admits(&self, updated_at: Timestamp) -> bool {
        self.last_pulled_at.map_or(true, |cursor| updated_at >= cursor)
    }

    /// Advance across the contiguous prefix of applied changes.
    ///
    /// `outcomes` must be sorted by timestamp. Advancing stops at the first
    /// change that was not applied so it is delivered again next time.
    pub fn advance(&mut self, outcomes: &[(Timestamp, bool)]) {
        for (updated_at, applied) in outcomes {
            if !applied {
                break;
            }
            let next = self
                .last_pulled_at
                .map_or(*updated_at, |cursor| cursor.max(*updated_at));
            self.last_pulled_at = Some(next);
        }
    }
}

/// A change reported by the remote on pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RemoteChange {
    /// The item was created or modified remotely (including soft deletes).
    Upsert { item: Item },
    /// The item was physically removed remotely.
    #[serde(rename_all = "camelCase")]
    Removed { id: ItemId, updated_at: Timestamp },
}

impl RemoteChange {
    pub fn item_id(&self) -> &str {
        match self {
            RemoteChange::Upsert { item } => &item.id,
            RemoteChange::Removed { id, .. } => id,
        }
    }

    pub fn updated_at(&self) -> Timestamp {
        match self {
            RemoteChange::Upsert { item } => item.updated_at,
            RemoteChange::Removed { updated_at, .. } => *updated_at,
        }
    }
}
