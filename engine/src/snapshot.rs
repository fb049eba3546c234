//! Snapshot types for persisting and restoring store state.
//!
//! Snapshots are the bridge between the in-memory store and a file on disk.
//! They are designed for deterministic serialization to ensure consistency.

use crate::{
    error::Result, Checkpoint, CollectionName, Error, IndexDef, Item, ItemId, QueueEntry, Schema,
    SchemaVersion,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// One collection inside a snapshot. Index contents are not stored; they
/// are rebuilt from the items on import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSnapshot {
    pub primary_key_path: String,
    pub indexes: Vec<IndexDef>,
    pub items: BTreeMap<ItemId, Item>,
}

/// A point-in-time snapshot of the store state.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Storage schema version at time of snapshot
    pub schema_version: SchemaVersion,
    pub collections: BTreeMap<CollectionName, CollectionSnapshot>,
    /// Replication queue in queue order
    #[serde(default)]
    pub queue: Vec<QueueEntry>,
    #[serde(default)]
    pub checkpoints: BTreeMap<CollectionName, Checkpoint>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            collections: BTreeMap::new(),
            queue: Vec::new(),
            checkpoints: BTreeMap::new(),
        }
    }

    /// Count total items across all collections.
    pub fn item_count(&self) -> usize {
        self.collections.values().map(|c| c.items.len()).sum()
    }

    /// Count active (non-deleted) items.
    pub fn active_item_count(&self) -> usize {
        self.collections
            .values()
            .flat_map(|c| c.items.values())
            .filter(|i| i.is_active())
            .count()
    }

    /// Check every collection and active item against an application schema.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        for (name, collection) in &self.collections {
            let collection_schema = schema.collection(name)?;
            for item in collection.items.values().filter(|i| i.is_active()) {
                collection_schema.validate_payload(&item.data)?;
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
