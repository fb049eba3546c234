//! Local persistent store.
//!
//! [`LocalStore`] covers items and their indexes, [`SyncStateStore`] the
//! replication queue and pull checkpoints. Both backends implement both
//! traits; [`Store`] is the combination the rest of the runtime works with.

mod memory;
mod pool;
mod sqlite;

pub use memory::MemoryBackend;
pub use pool::*;
pub use sqlite::SqliteStore;

use crate::error::Result;
use async_trait::async_trait;
use harbor_engine::{
    Checkpoint, IndexDef, Item, KeyRange, QueueEntry, SchemaChange, SchemaVersion,
};
use serde_json::Value;

/// Items keyed by id per collection, with secondary indexes.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Create or upgrade a collection so it carries at least `indexes`.
    /// Idempotent; concurrent calls serialize.
    async fn ensure(
        &self,
        collection: &str,
        primary_key_path: &str,
        indexes: &[IndexDef],
    ) -> Result<SchemaChange>;

    /// Incremented once per upgrade that changed something.
    async fn schema_version(&self) -> Result<SchemaVersion>;

    async fn index_defs(&self, collection: &str) -> Result<Vec<IndexDef>>;

    /// Insert or replace. A unique index collision fails without writing.
    async fn put(&self, item: &Item) -> Result<()>;

    /// `Ok(None)` when the item does not exist.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Item>>;

    /// Physically remove an item. Returns whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    async fn get_all(&self, collection: &str) -> Result<Vec<Item>>;

    async fn get_all_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> Result<Vec<Item>>;

    async fn get_by_range(
        &self,
        collection: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Vec<Item>>;

    /// Number of stored items, soft-deleted included.
    async fn count(&self, collection: &str) -> Result<usize>;
}

/// Durable replication bookkeeping.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Append an entry; the returned copy carries its queue position.
    async fn enqueue(&self, entry: QueueEntry) -> Result<QueueEntry>;

    /// Entries in queue order, optionally for one collection.
    async fn queue_entries(&self, collection: Option<&str>) -> Result<Vec<QueueEntry>>;

    async fn update_queue_entry(&self, entry: &QueueEntry) -> Result<()>;

    async fn remove_queue_entry(&self, id: &str) -> Result<bool>;

    async fn checkpoint(&self, collection: &str) -> Result<Checkpoint>;

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// A complete local store.
pub trait Store: LocalStore + SyncStateStore {}

impl<T: LocalStore + SyncStateStore> Store for T {}
