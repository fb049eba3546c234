//! In-memory backend over the engine's `MemoryStore`.
//!
//! Nothing survives a restart unless the state is exported; useful for
//! tests and for contexts that only cache.

use super::{LocalStore, SyncStateStore};
use crate::error::Result;
use async_trait::async_trait;
use harbor_engine::{
    Checkpoint, IndexDef, Item, KeyRange, MemoryStore, QueueEntry, SchemaChange, SchemaVersion,
    StoreSnapshot,
};
use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: RwLock<MemoryStore>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a snapshot produced by [`MemoryBackend::export_state`].
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self> {
        Ok(Self {
            inner: RwLock::new(MemoryStore::import_state(snapshot)?),
        })
    }

    pub async fn export_state(&self) -> StoreSnapshot {
        self.inner.read().await.export_state()
    }
}

#[async_trait]
impl LocalStore for MemoryBackend {
    async fn ensure(
        &self,
        collection: &str,
        primary_key_path: &str,
        indexes: &[IndexDef],
    ) -> Result<SchemaChange> {
        // The write lock doubles as the upgrade lock.
        let mut store = self.inner.write().await;
        let change = store.ensure(collection, primary_key_path, indexes)?;
        if !change.is_noop() {
            tracing::debug!(
                collection = %collection,
                added = ?change.added_indexes,
                version = store.schema_version(),
                "Schema upgraded"
            );
        }
        Ok(change)
    }

    async fn schema_version(&self) -> Result<SchemaVersion> {
        Ok(self.inner.read().await.schema_version())
    }

    async fn index_defs(&self, collection: &str) -> Result<Vec<IndexDef>> {
        Ok(self.inner.read().await.index_defs(collection)?)
    }

    async fn put(&self, item: &Item) -> Result<()> {
        Ok(self.inner.write().await.put(item.clone())?)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Item>> {
        Ok(self.inner.read().await.get(collection, id)?.cloned())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self.inner.write().await.delete(collection, id)?.is_some())
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Item>> {
        Ok(self.inner.read().await.get_all(collection)?)
    }

    async fn get_all_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> Result<Vec<Item>> {
        Ok(self
            .inner
            .read()
            .await
            .get_all_by_index(collection, index, value)?)
    }

    async fn get_by_range(
        &self,
        collection: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Vec<Item>> {
        Ok(self
            .inner
            .read()
            .await
            .get_by_range(collection, index, range)?)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.inner.read().await.count(collection)?)
    }
}

#[async_trait]
impl SyncStateStore for MemoryBackend {
    async fn enqueue(&self, entry: QueueEntry) -> Result<QueueEntry> {
        Ok(self.inner.write().await.enqueue(entry))
    }

    async fn queue_entries(&self, collection: Option<&str>) -> Result<Vec<QueueEntry>> {
        Ok(self.inner.read().await.queue_entries(collection))
    }

    async fn update_queue_entry(&self, entry: &QueueEntry) -> Result<()> {
        Ok(self.inner.write().await.update_queue_entry(entry)?)
    }

    async fn remove_queue_entry(&self, id: &str) -> Result<bool> {
        Ok(self.inner.write().await.remove_queue_entry(id))
    }

    async fn checkpoint(&self, collection: &str) -> Result<Checkpoint> {
        Ok(self.inner.read().await.checkpoint(collection))
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.inner.write().await.set_checkpoint(checkpoint.clone());
        Ok(())
    }
}
