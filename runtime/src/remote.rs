//! Remote backend and attachment storage seams.
//!
//! The replication engine only talks to the outside world through
//! [`RemoteBackend`] (items) and [`StorageStrategy`] (file blobs). The
//! in-memory implementations here back the tests and the demo binary.

use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use harbor_engine::{Checkpoint, Item, ItemId, QueueAction, QueueEntry, RemoteChange, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Live stream of remote changes for one collection.
pub type ChangeFeed = BoxStream<'static, RemoteChange>;

/// Response to a pull call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub changes: Vec<RemoteChange>,
    /// Cursor suggested by the backend. Advisory only.
    #[serde(default)]
    pub new_checkpoint: Option<Timestamp>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Response to a push call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub succeeded_ids: Vec<ItemId>,
    #[serde(default)]
    pub failed_ids: Vec<ItemId>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Remote source and sink of item changes.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Changes of `collection` at or after the checkpoint cursor.
    async fn pull(&self, collection: &str, checkpoint: &Checkpoint) -> Result<PullResponse>;

    /// Send queued changes. An `Err` means none of them were accepted.
    async fn push(&self, collection: &str, entries: &[QueueEntry]) -> Result<PushResponse>;

    /// Live change feed, if the backend supports one.
    async fn subscribe(&self, _collection: &str) -> Result<Option<ChangeFeed>> {
        Ok(None)
    }
}

/// Remote blob storage for attachments.
#[async_trait]
pub trait StorageStrategy: Send + Sync {
    /// Store `bytes` under `path` and return the remote path to record.
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String>;

    async fn download(&self, path: &str) -> Result<Vec<u8>>;

    async fn delete(&self, path: &str) -> Result<()>;
}

struct Subscriber {
    collection: String,
    sender: mpsc::UnboundedSender<RemoteChange>,
}

/// In-memory remote holding the latest state of every item, tombstones
/// included.
///
/// Shared by several replication engines it behaves like a server: pushes
/// from one are visible to pulls and change feeds of the others.
#[derive(Default)]
pub struct MemoryRemote {
    collections: Mutex<BTreeMap<String, BTreeMap<ItemId, RemoteChange>>>,
    subscribers: DashMap<String, Subscriber>,
    offline: AtomicBool,
    rejected: Mutex<HashSet<ItemId>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Refuse pushes for one item id.
    pub fn reject_item(&self, id: impl Into<ItemId>) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.insert(id.into());
        }
    }

    pub fn accept_item(&self, id: &str) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.remove(id);
        }
    }

    /// Write a change as if another client had pushed it.
    pub fn apply(&self, collection: &str, change: RemoteChange) {
        if let Ok(mut collections) = self.collections.lock() {
            collections
                .entry(collection.to_string())
                .or_default()
                .insert(change.item_id().to_string(), change.clone());
        }
        self.notify(collection, change);
    }

    /// Current remote state of an item, if it is not removed.
    pub fn item(&self, collection: &str, id: &str) -> Option<Item> {
        let collections = self.collections.lock().ok()?;
        match collections.get(collection)?.get(id)? {
            RemoteChange::Upsert { item } => Some(item.clone()),
            RemoteChange::Removed { .. } => None,
        }
    }

    pub fn is_removed(&self, collection: &str, id: &str) -> bool {
        self.collections
            .lock()
            .ok()
            .and_then(|c| c.get(collection).and_then(|items| items.get(id).cloned()))
            .is_some_and(|change| matches!(change, RemoteChange::Removed { .. }))
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RuntimeError::Remote("remote unreachable".to_string()));
        }
        Ok(())
    }

    fn notify(&self, collection: &str, change: RemoteChange) {
        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if sub.collection == collection && sub.sender.send(change.clone()).is_err() {
                closed.push(entry.key().clone());
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
    }

    fn to_change(entry: &QueueEntry) -> RemoteChange {
        match entry.action {
            QueueAction::Create | QueueAction::Update => RemoteChange::Upsert {
                item: entry.snapshot.clone(),
            },
            QueueAction::Delete => RemoteChange::Removed {
                id: entry.item_id.clone(),
                updated_at: entry.snapshot.updated_at.max(entry.enqueued_at),
            },
        }
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
    async fn pull(&self, collection: &str, checkpoint: &Checkpoint) -> Result<PullResponse> {
        self.check_online()?;
        let collections = self
            .collections
            .lock()
            .map_err(|_| RuntimeError::Remote("remote state poisoned".to_string()))?;
        let mut changes: Vec<RemoteChange> = collections
            .get(collection)
            .map(|items| {
                items
                    .values()
                    .filter(|c| checkpoint.admits(c.updated_at()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        changes.sort_by_key(|c| c.updated_at());
        let new_checkpoint = changes.last().map(|c| c.updated_at());
        Ok(PullResponse {
            changes,
            new_checkpoint,
            errors: Vec::new(),
        })
    }

    async fn push(&self, collection: &str, entries: &[QueueEntry]) -> Result<PushResponse> {
        self.check_online()?;
        let rejected = self
            .rejected
            .lock()
            .map_err(|_| RuntimeError::Remote("remote state poisoned".to_string()))?
            .clone();

        let mut response = PushResponse::default();
        for entry in entries {
            if rejected.contains(&entry.item_id) {
                response.failed_ids.push(entry.item_id.clone());
                response
                    .errors
                    .push(format!("{}: rejected by remote", entry.item_id));
                continue;
            }
            self.apply(collection, Self::to_change(entry));
            response.succeeded_ids.push(entry.item_id.clone());
        }
        Ok(response)
    }

    async fn subscribe(&self, collection: &str) -> Result<Option<ChangeFeed>> {
        self.check_online()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().to_string();
        self.subscribers.insert(
            id.clone(),
            Subscriber {
                collection: collection.to_string(),
                sender,
            },
        );
        tracing::debug!(subscriber = %id, collection = %collection, "Change feed opened");

        let feed = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|change| (change, receiver))
        });
        Ok(Some(Box::pin(feed)))
    }
}

/// In-memory blob storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: DashMap<String, Vec<u8>>,
    offline: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.blobs.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RuntimeError::Attachment("storage unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageStrategy for MemoryStorage {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String> {
        self.check_online()?;
        self.blobs.insert(path.to_string(), bytes);
        Ok(path.to_string())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        self.check_online()?;
        self.blobs
            .get(path)
            .map(|b| b.value().clone())
            .ok_or_else(|| RuntimeError::Attachment(format!("remote file {path} not found")))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_online()?;
        self.blobs.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn item(id: &str, at: Timestamp) -> Item {
        Item::new(id, "todos", json!({ "title": id }), "remote", at)
    }

    #[tokio::test]
    async fn pull_is_sorted_and_inclusive() {
        let remote = MemoryRemote::new();
        remote.apply("todos", RemoteChange::Upsert { item: item("b", 20) });
        remote.apply("todos", RemoteChange::Upsert { item: item("a", 10) });
        remote.apply("todos", RemoteChange::Upsert { item: item("c", 30) });

        let mut checkpoint = Checkpoint::new("todos");
        checkpoint.last_pulled_at = Some(20);
        let response = remote.pull("todos", &checkpoint).await.unwrap();
        let ids: Vec<_> = response.changes.iter().map(|c| c.item_id()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(response.new_checkpoint, Some(30));
    }

    #[tokio::test]
    async fn push_applies_and_rejects() {
        let remote = MemoryRemote::new();
        remote.reject_item("bad");
        let good = QueueEntry::new("q1", QueueAction::Create, item("good", 1), vec![], 1);
        let bad = QueueEntry::new("q2", QueueAction::Create, item("bad", 1), vec![], 1);

        let response = remote.push("todos", &[good, bad]).await.unwrap();
        assert_eq!(response.succeeded_ids, vec!["good".to_string()]);
        assert_eq!(response.failed_ids, vec!["bad".to_string()]);
        assert!(remote.item("todos", "good").is_some());
        assert!(remote.item("todos", "bad").is_none());
    }

    #[tokio::test]
    async fn delete_becomes_tombstone() {
        let remote = MemoryRemote::new();
        let entry = QueueEntry::new("q1", QueueAction::Delete, item("a", 5), vec![], 9);
        remote.push("todos", &[entry]).await.unwrap();
        assert!(remote.is_removed("todos", "a"));

        let response = remote
            .pull("todos", &Checkpoint::new("todos"))
            .await
            .unwrap();
        assert_eq!(response.changes[0].updated_at(), 9);
    }

    #[tokio::test]
    async fn offline_fails_calls() {
        let remote = MemoryRemote::new();
        remote.set_offline(true);
        assert!(remote.pull("todos", &Checkpoint::new("todos")).await.is_err());
        assert!(remote.push("todos", &[]).await.is_err());
    }

    #[tokio::test]
    async fn feed_delivers_collection_changes() {
        let remote = MemoryRemote::new();
        let mut feed = remote.subscribe("todos").await.unwrap().unwrap();
        remote.apply("notes", RemoteChange::Upsert { item: item("n", 1) });
        remote.apply("todos", RemoteChange::Upsert { item: item("t", 2) });

        let change = feed.next().await.unwrap();
        assert_eq!(change.item_id(), "t");
    }

    #[tokio::test]
    async fn storage_round_trip() {
        let storage = MemoryStorage::new();
        let path = storage.upload("todos/a/f1", b"data".to_vec()).await.unwrap();
        assert_eq!(storage.download(&path).await.unwrap(), b"data");
        storage.delete(&path).await.unwrap();
        assert!(storage.download(&path).await.is_err());
    }
}
