//! Items: domain data plus the control metadata the sync layer needs.

use crate::{
    clock::stamp_after, error::Result, ActorId, CollectionName, CollectionSchema, Error, ItemId,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;

/// Origin of the last write to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Created or modified locally
    Local,
    /// Received from remote/server
    Remote,
}

/// What a single update-log entry recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateKind {
    Create,
    Update,
    SoftDelete,
    Restore,
}

/// One entry of the append-only update log.
///
/// `before` and `after` only carry the top-level keys that changed; a key
/// absent on one side is recorded as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLogEntry {
    pub actor: ActorId,
    pub at: Timestamp,
    pub kind: UpdateKind,
    pub before: Value,
    pub after: Value,
}

/// Replication state of a file attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentStatus {
    /// Stored locally, not yet uploaded
    Local,
    /// Present both locally and remotely
    Synced,
    /// The last upload/download/store attempt failed
    Failed,
}

/// The value stored in a file-typed field: a reference, never the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    /// Identifier in the local attachment store. Empty when the file never
    /// made it into the store.
    pub file_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    pub status: AttachmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileRef {
    /// Parse a field value; anything that is not a well-formed reference
    /// yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// A reference that records a failed attachment write.
    pub fn failed(name: impl Into<String>, mime_type: impl Into<String>, error: String) -> Self {
        Self {
            file_id: String::new(),
            name: name.into(),
            mime_type: mime_type.into(),
            size: 0,
            remote_path: None,
            status: AttachmentStatus::Failed,
            error: Some(error),
        }
    }

    /// True when the local blob exists and still has to be uploaded.
    pub fn needs_upload(&self) -> bool {
        !self.file_id.is_empty() && self.remote_path.is_none()
    }

    /// True when only the remote copy exists.
    pub fn needs_download(&self) -> bool {
        self.file_id.is_empty() && self.remote_path.is_some()
    }
}

/// A stored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Stable identifier, generated once
    pub id: ItemId,
    /// Collection this item belongs to
    pub collection: CollectionName,
    /// The domain record (a JSON object)
    pub data: Value,
    pub created_at: Timestamp,
    #[serde(default)]
    pub created_by: Option<ActorId>,
    /// Sole input to conflict resolution and pull cursors
    pub updated_at: Timestamp,
    #[serde(default)]
    pub update_log: Vec<UpdateLogEntry>,
    /// Soft delete flag (tombstone)
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<Timestamp>,
    #[serde(default)]
    pub deleted_by: Option<ActorId>,
    pub origin: Origin,
}

impl Item {
    /// Create a new local item and record its creation in the update log.
    pub fn new(
        id: impl Into<ItemId>,
        collection: impl Into<CollectionName>,
        data: Value,
        actor: impl Into<ActorId>,
        now: Timestamp,
    ) -> Self {
        let actor = actor.into();
        let entry = UpdateLogEntry {
            actor: actor.clone(),
            at: now,
            kind: UpdateKind::Create,
            before: Value::Object(Map::new()),
            after: data.clone(),
        };
        Self {
            id: id.into(),
            collection: collection.into(),
            data,
            created_at: now,
            created_by: Some(actor),
            updated_at: now,
            update_log: vec![entry],
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
            origin: Origin::Local,
        }
    }

    /// Check if item is active (not soft-deleted).
    pub fn is_active(&self) -> bool {
        !self.is_deleted
    }

    /// Resolve a field for querying, sorting or indexing.
    ///
    /// `id`, `createdAt`, `updatedAt`, `deletedAt` and `isDeleted` address
    /// metadata; every other path is a dot-separated path into `data`.
    pub fn field(&self, path: &str) -> Option<Cow<'_, Value>> {
        match path {
            "id" => Some(Cow::Owned(Value::String(self.id.clone()))),
            "createdAt" => Some(Cow::Owned(Value::from(self.created_at))),
            "updatedAt" => Some(Cow::Owned(Value::from(self.updated_at))),
            "deletedAt" => self.deleted_at.map(|t| Cow::Owned(Value::from(t))),
            "isDeleted" => Some(Cow::Owned(Value::Bool(self.is_deleted))),
            _ => data_path(&self.data, path).map(Cow::Borrowed),
        }
    }

    /// Merge a partial payload into the data.
    ///
    /// The merge is shallow: each top-level key of `patch` replaces the
    /// stored key, and `null` removes it. Exactly one log entry is appended.
    pub fn apply_patch(&mut self, patch: &Value, actor: &str, now: Timestamp) -> Result<()> {
        if self.is_deleted {
            return Err(Error::invalid_state(
                self.id.clone(),
                "cannot update a soft-deleted item",
            ));
        }
        let patch = patch
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("patch must be an object".into()))?;

        let mut data = match &self.data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let mut before = Map::new();
        let mut after = Map::new();
        for (key, value) in patch {
            let old = data.get(key).cloned().unwrap_or(Value::Null);
            if &old == value {
                continue;
            }
            before.insert(key.clone(), old);
            after.insert(key.clone(), value.clone());
            if value.is_null() {
                data.remove(key);
            } else {
                data.insert(key.clone(), value.clone());
            }
        }

        self.data = Value::Object(data);
        self.touch(actor, now, UpdateKind::Update, before, after);
        Ok(())
    }

    /// Mark item as soft-deleted.
    pub fn soft_delete(&mut self, actor: &str, now: Timestamp) -> Result<()> {
        if self.is_deleted {
            return Err(Error::invalid_state(self.id.clone(), "item is already deleted"));
        }
        let stamp = stamp_after(self.updated_at, now);
        self.is_deleted = true;
        self.deleted_at = Some(stamp);
        self.deleted_by = Some(actor.to_string());
        self.touch(
            actor,
            now,
            UpdateKind::SoftDelete,
            deletion_flag(false),
            deletion_flag(true),
        );
        Ok(())
    }

    /// Bring a soft-deleted item back.
    pub fn restore(&mut self, actor: &str, now: Timestamp) -> Result<()> {
        if !self.is_deleted {
            return Err(Error::invalid_state(
                self.id.clone(),
                "only soft-deleted items can be restored",
            ));
        }
        self.is_deleted = false;
        self.deleted_at = None;
        self.deleted_by = None;
        self.touch(
            actor,
            now,
            UpdateKind::Restore,
            deletion_flag(true),
            deletion_flag(false),
        );
        Ok(())
    }

    /// All well-formed file references held by the schema's file fields.
    pub fn file_refs(&self, schema: &CollectionSchema) -> Vec<(String, FileRef)> {
        schema
            .file_fields()
            .filter_map(|field| {
                let value = self.data.get(&field.name)?;
                FileRef::from_value(value).map(|r| (field.name.clone(), r))
            })
            .collect()
    }

    /// Rewrite a file reference in place. Attachment bookkeeping is not a
    /// user mutation: neither `updatedAt` nor the log changes.
    pub fn set_file_ref(&mut self, field: &str, file_ref: &FileRef) {
        if let Value::Object(map) = &mut self.data {
            map.insert(field.to_string(), file_ref.to_value());
        }
    }

    fn touch(
        &mut self,
        actor: &str,
        now: Timestamp,
        kind: UpdateKind,
        before: Map<String, Value>,
        after: Map<String, Value>,
    ) {
        self.updated_at = stamp_after(self.updated_at, now);
        self.origin = Origin::Local;
        self.update_log.push(UpdateLogEntry {
            actor: actor.to_string(),
            at: self.updated_at,
            kind,
            before: Value::Object(before),
            after: Value::Object(after),
        });
    }
}

fn deletion_flag(deleted: bool) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("isDeleted".to_string(), Value::Bool(deleted));
    map
}

/// Follow a dot-separated path through nested objects.
pub fn data_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}
