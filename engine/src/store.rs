//! MemoryStore - the in-memory local store.
//!
//! Holds items per collection together with their secondary indexes, the
//! replication queue and the pull checkpoints. Every mutation either fully
//! applies or leaves the store untouched.

use crate::{
    error::Result, validate_index_set, Checkpoint, CollectionName, Error, IndexDef, IndexKey, Item,
    ItemId, KeyRange, QueueEntry, SchemaVersion, SecondaryIndex,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Items and indexes of one collection.
#[derive(Debug, Clone)]
pub struct CollectionState {
    primary_key_path: String,
    items: BTreeMap<ItemId, Item>,
    indexes: BTreeMap<String, SecondaryIndex>,
}

impl CollectionState {
    fn new(primary_key_path: impl Into<String>) -> Self {
        Self {
            primary_key_path: primary_key_path.into(),
            items: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    pub fn primary_key_path(&self) -> &str {
        &self.primary_key_path
    }

    /// Get an item by id, including soft-deleted ones.
    pub fn get(&self, id: &str) -> Option<&Item> {
        self.items.get(id)
    }

    /// All items in id order.
    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn index(&self, name: &str) -> Option<&SecondaryIndex> {
        self.indexes.get(name)
    }

    pub fn index_defs(&self) -> Vec<IndexDef> {
        self.indexes.values().map(|i| i.def().clone()).collect()
    }

    /// Number of stored items, soft-deleted included.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn put(&mut self, item: Item) -> Result<()> {
        // Check every unique index before touching anything.
        for index in self.indexes.values() {
            index.check_unique(&item)?;
        }
        if let Some(previous) = self.items.get(&item.id) {
            for index in self.indexes.values_mut() {
                index.remove(previous);
            }
        }
        for index in self.indexes.values_mut() {
            index.insert(&item)?;
        }
        self.items.insert(item.id.clone(), item);
        Ok(())
    }

    fn remove(&mut self, id: &str) -> Option<Item> {
        let item = self.items.remove(id)?;
        for index in self.indexes.values_mut() {
            index.remove(&item);
        }
        Some(item)
    }

    fn ids_to_items(&self, ids: Vec<ItemId>) -> Vec<Item> {
        ids.into_iter()
            .filter_map(|id| self.items.get(&id).cloned())
            .collect()
    }
}

/// What an `ensure` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaChange {
    /// The collection did not exist before
    pub created: bool,
    /// Indexes built by this upgrade
    pub added_indexes: Vec<String>,
}

impl SchemaChange {
    pub fn is_noop(&self) -> bool {
        !self.created && self.added_indexes.is_empty()
    }
}

/// The in-memory local store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    collections: BTreeMap<CollectionName, CollectionState>,
    /// Incremented once per schema upgrade that changed something
    schema_version: SchemaVersion,
    queue: Vec<QueueEntry>,
    next_seq: u64,
    checkpoints: BTreeMap<CollectionName, Checkpoint>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schema_version(&self) -> SchemaVersion {
        self.schema_version
    }

    /// Create or upgrade a collection so it carries at least `indexes`.
    ///
    /// Missing indexes are built from the stored items first and only
    /// installed once every one of them built cleanly, so a failing unique
    /// backfill leaves the previous schema in place. Existing indexes that
    /// are not requested are kept. An index whose name is already taken by
    /// a different definition is rejected.
    pub fn ensure(
        &mut self,
        collection: &str,
        primary_key_path: &str,
        indexes: &[IndexDef],
    ) -> Result<SchemaChange> {
        validate_index_set(collection, indexes)?;

        let existing = self.collections.get(collection);
        if let Some(state) = existing {
            if state.primary_key_path != primary_key_path {
                return Err(Error::SchemaUpgrade {
                    collection: collection.to_string(),
                    reason: format!(
                        "primary key path is {:?}, not {:?}",
                        state.primary_key_path, primary_key_path
                    ),
                });
            }
        }

        let mut staged: Vec<SecondaryIndex> = Vec::new();
        for def in indexes {
            if staged.iter().any(|i| i.def().name == def.name) {
                continue;
            }
            match existing.and_then(|s| s.indexes.get(&def.name)) {
                Some(index) if index.def() == def => continue,
                Some(index) => {
                    return Err(Error::SchemaUpgrade {
                        collection: collection.to_string(),
                        reason: format!(
                            "index {} already exists over {}",
                            def.name,
                            index.def().key_path
                        ),
                    })
                }
                None => {}
            }
            let items = existing.into_iter().flat_map(|s| s.items.values());
            let index =
                SecondaryIndex::build(def.clone(), items).map_err(|e| Error::SchemaUpgrade {
                    collection: collection.to_string(),
                    reason: e.to_string(),
                })?;
            staged.push(index);
        }

        let change = SchemaChange {
            created: existing.is_none(),
            added_indexes: staged.iter().map(|i| i.def().name.clone()).collect(),
        };
        if change.is_noop() {
            return Ok(change);
        }

        let state = self
            .collections
            .entry(collection.to_string())
            .or_insert_with(|| CollectionState::new(primary_key_path));
        for index in staged {
            state.indexes.insert(index.def().name.clone(), index);
        }
        self.schema_version += 1;
        Ok(change)
    }

    pub fn collection(&self, name: &str) -> Result<&CollectionState> {
        self.collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut CollectionState> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    pub fn collection_names(&self) -> Vec<CollectionName> {
        self.collections.keys().cloned().collect()
    }

    /// Insert or replace an item. Fails without side effects on a unique
    /// index collision.
    pub fn put(&mut self, item: Item) -> Result<()> {
        self.collection_mut(&item.collection.clone())?.put(item)
    }

    pub fn get(&self, collection: &str, id: &str) -> Result<Option<&Item>> {
        Ok(self.collection(collection)?.get(id))
    }

    /// Physically remove an item, returning it if it existed.
    pub fn delete(&mut self, collection: &str, id: &str) -> Result<Option<Item>> {
        Ok(self.collection_mut(collection)?.remove(id))
    }

    pub fn get_all(&self, collection: &str) -> Result<Vec<Item>> {
        Ok(self.collection(collection)?.items().cloned().collect())
    }

    /// Items whose key under `index` equals `value`. Unindexable values
    /// (null, arrays, objects) match nothing.
    pub fn get_all_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> Result<Vec<Item>> {
        let state = self.collection(collection)?;
        let index = state.index(index).ok_or_else(|| Error::IndexNotFound {
            collection: collection.to_string(),
            index: index.to_string(),
        })?;
        let Some(key) = IndexKey::from_value(value) else {
            return Ok(Vec::new());
        };
        Ok(state.ids_to_items(index.lookup(&key)))
    }

    /// Items whose key under `index` falls in `range`, in key order.
    pub fn get_by_range(
        &self,
        collection: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Vec<Item>> {
        let state = self.collection(collection)?;
        let index = state.index(index).ok_or_else(|| Error::IndexNotFound {
            collection: collection.to_string(),
            index: index.to_string(),
        })?;
        Ok(state.ids_to_items(index.range(range)))
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.collection(collection)?.len())
    }

    pub fn index_defs(&self, collection: &str) -> Result<Vec<IndexDef>> {
        Ok(self.collection(collection)?.index_defs())
    }

    // ------------------------------------------------------------------
    // Replication queue
    // ------------------------------------------------------------------

    /// Append an entry, assigning its queue position.
    pub fn enqueue(&mut self, mut entry: QueueEntry) -> QueueEntry {
        self.next_seq += 1;
        entry.seq = self.next_seq;
        self.queue.push(entry.clone());
        entry
    }

    /// Entries in queue order, optionally restricted to one collection.
    pub fn queue_entries(&self, collection: Option<&str>) -> Vec<QueueEntry> {
        self.queue
            .iter()
            .filter(|e| collection.map_or(true, |c| e.collection == c))
            .cloned()
            .collect()
    }

    /// Overwrite a stored entry with the same id.
    pub fn update_queue_entry(&mut self, entry: &QueueEntry) -> Result<()> {
        let slot = self
            .queue
            .iter_mut()
            .find(|e| e.id == entry.id)
            .ok_or_else(|| Error::Storage(format!("queue entry {} not found", entry.id)))?;
        *slot = entry.clone();
        Ok(())
    }

    pub fn remove_queue_entry(&mut self, id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|e| e.id != id);
        self.queue.len() != before
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub fn checkpoint(&self, collection: &str) -> Checkpoint {
        self.checkpoints
            .get(collection)
            .cloned()
            .unwrap_or_else(|| Checkpoint::new(collection))
    }

    pub fn set_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints
            .insert(checkpoint.collection.clone(), checkpoint);
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Export the whole store as a snapshot.
    pub fn export_state(&self) -> crate::snapshot::StoreSnapshot {
        let mut snapshot = crate::snapshot::StoreSnapshot::new(self.schema_version);
        for (name, state) in &self.collections {
            snapshot.collections.insert(
                name.clone(),
                crate::snapshot::CollectionSnapshot {
                    primary_key_path: state.primary_key_path.clone(),
                    indexes: state.index_defs(),
                    items: state.items.clone(),
                },
            );
        }
        snapshot.queue = self.queue.clone();
        snapshot.checkpoints = self.checkpoints.clone();
        snapshot
    }

    /// Rebuild a store from a snapshot, re-deriving every index.
    pub fn import_state(snapshot: crate::snapshot::StoreSnapshot) -> Result<Self> {
        let mut collections = BTreeMap::new();
        for (name, collection) in snapshot.collections {
            let mut state = CollectionState::new(collection.primary_key_path);
            for def in collection.indexes {
                let index = SecondaryIndex::build(def, collection.items.values())?;
                state.indexes.insert(index.def().name.clone(), index);
            }
            state.items = collection.items;
            collections.insert(name, state);
        }
        let next_seq = snapshot.queue.iter().map(|e| e.seq).max().unwrap_or(0);
        Ok(Self {
            collections,
            schema_version: snapshot.schema_version,
            queue: snapshot.queue,
            next_seq,
            checkpoints: snapshot.checkpoints,
        })
    }
}
