//! CRUD and lifecycle operations over a [`Store`].
//!
//! Items move `Active -> SoftDeleted -> (Active | Purged)`; hard delete
//! removes an item from any state. Every mutation is persisted first, then
//! queued for replication (when configured), then published to projections.
//! A write whose queue entry cannot be recorded is reverted.

use crate::attachments::{AttachmentStore, FileInput};
use crate::clock::SystemClock;
use crate::error::{Result, RuntimeError};
use crate::projection::ProjectionHub;
use crate::replication::ReplicationEngine;
use crate::store::Store;
use dashmap::DashSet;
use harbor_engine::{
    ActorId, AttachmentStatus, Clock, CollectionName, CollectionSchema, Error, FileRef, Item,
    ItemId, QueueAction, Schema, PRIMARY_KEY_PATH,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Input for [`Repository::create`].
#[derive(Debug, Clone)]
pub struct CreateInput {
    pub collection: CollectionName,
    pub actor: ActorId,
    pub data: Value,
    /// Files to store in file-typed fields, by field name
    pub files: Vec<(String, FileInput)>,
}

impl CreateInput {
    pub fn new(collection: impl Into<CollectionName>, actor: impl Into<ActorId>, data: Value) -> Self {
        Self {
            collection: collection.into(),
            actor: actor.into(),
            data,
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, field: impl Into<String>, file: FileInput) -> Self {
        self.files.push((field.into(), file));
        self
    }
}

/// Input for [`Repository::update`]. `patch` is merged per top-level key;
/// `null` clears a key.
#[derive(Debug, Clone)]
pub struct UpdateInput {
    pub collection: CollectionName,
    pub id: ItemId,
    pub actor: ActorId,
    pub patch: Value,
    pub files: Vec<(String, FileInput)>,
}

impl UpdateInput {
    pub fn new(
        collection: impl Into<CollectionName>,
        id: impl Into<ItemId>,
        actor: impl Into<ActorId>,
        patch: Value,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            actor: actor.into(),
            patch,
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, field: impl Into<String>, file: FileInput) -> Self {
        self.files.push((field.into(), file));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMode {
    #[default]
    Soft,
    Hard,
}

pub struct Repository {
    store: Arc<dyn Store>,
    schema: Arc<Schema>,
    clock: Arc<dyn Clock>,
    attachments: Option<Arc<dyn AttachmentStore>>,
    replication: Option<Arc<ReplicationEngine>>,
    projections: Option<Arc<ProjectionHub>>,
    ensured: DashSet<CollectionName>,
}

impl Repository {
    pub fn new(store: Arc<dyn Store>, schema: Arc<Schema>) -> Self {
        Self {
            store,
            schema,
            clock: Arc::new(SystemClock),
            attachments: None,
            replication: None,
            projections: None,
            ensured: DashSet::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_attachments(mut self, attachments: Arc<dyn AttachmentStore>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    /// Queue every successful mutation on `replication`.
    pub fn with_replication(mut self, replication: Arc<ReplicationEngine>) -> Self {
        self.replication = Some(replication);
        self
    }

    pub fn with_projections(mut self, projections: Arc<ProjectionHub>) -> Self {
        self.projections = Some(projections);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Create or upgrade the storage of every collection in the schema.
    /// Collections are otherwise prepared lazily on first use.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut names: Vec<&CollectionName> = self.schema.collections.keys().collect();
        names.sort();
        for name in names {
            self.ensure_collection(name).await?;
        }
        Ok(())
    }

    async fn ensure_collection(&self, collection: &str) -> Result<&CollectionSchema> {
        let schema = self.schema.collection(collection)?;
        if !self.ensured.contains(collection) {
            let change = self
                .store
                .ensure(collection, PRIMARY_KEY_PATH, &schema.index_defs())
                .await?;
            if !change.is_noop() {
                tracing::info!(
                    collection = %collection,
                    created = change.created,
                    indexes = ?change.added_indexes,
                    "Collection storage prepared"
                );
            }
            self.ensured.insert(collection.to_string());
        }
        Ok(schema)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// An active item, `None` when absent or soft-deleted.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Item>> {
        Ok(self
            .get_including_deleted(collection, id)
            .await?
            .filter(Item::is_active))
    }

    pub async fn get_including_deleted(&self, collection: &str, id: &str) -> Result<Option<Item>> {
        self.ensure_collection(collection).await?;
        self.store.get(collection, id).await
    }

    async fn require(&self, collection: &str, id: &str) -> Result<Item> {
        self.store
            .get(collection, id)
            .await?
            .ok_or_else(|| Error::not_found(collection, id).into())
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    pub async fn create(&self, input: CreateInput) -> Result<Item> {
        let schema = self.ensure_collection(&input.collection).await?;

        let Value::Object(mut data) = input.data else {
            return Err(Error::InvalidPayload("item data must be an object".to_string()).into());
        };
        self.check_file_fields(schema, &input.files)?;
        let (refs, stored) = self.store_files(input.files).await;
        for (field, file_ref) in refs {
            data.insert(field, file_ref.to_value());
        }
        let data = Value::Object(data);

        if let Err(e) = schema.validate_payload(&data) {
            self.discard_files(&stored).await;
            return Err(e.into());
        }

        let id = uuid::Uuid::new_v4().to_string();
        let item = Item::new(id, &input.collection, data, &input.actor, self.clock.now());
        let written = async {
            self.store.put(&item).await?;
            self.enqueue_or_revert(&item, QueueAction::Create, None).await
        }
        .await;
        if let Err(e) = written {
            self.discard_files(&stored).await;
            return Err(e);
        }

        tracing::info!(collection = %item.collection, item_id = %item.id, "Item created");
        self.publish(&item.collection).await;
        Ok(item)
    }

    pub async fn update(&self, input: UpdateInput) -> Result<Item> {
        let schema = self.ensure_collection(&input.collection).await?;
        let mut item = self.require(&input.collection, &input.id).await?;

        let Value::Object(mut patch) = input.patch else {
            return Err(Error::InvalidPayload("patch must be an object".to_string()).into());
        };
        self.check_file_fields(schema, &input.files)?;
        if !item.is_active() {
            return Err(Error::invalid_state(&item.id, "cannot update a deleted item").into());
        }

        let before = file_ids(&item, schema);
        let (refs, stored) = self.store_files(input.files).await;
        for (field, file_ref) in refs {
            patch.insert(field, file_ref.to_value());
        }
        let patch = Value::Object(patch);

        let mut merged = item.data.clone();
        merge_into(&mut merged, &patch);
        if let Err(e) = schema.validate_payload(&merged) {
            self.discard_files(&stored).await;
            return Err(e.into());
        }

        let previous = item.clone();
        item.apply_patch(&patch, &input.actor, self.clock.now())?;
        let written = async {
            self.store.put(&item).await?;
            self.enqueue_or_revert(&item, QueueAction::Update, Some(&previous))
                .await
        }
        .await;
        if let Err(e) = written {
            self.discard_files(&stored).await;
            return Err(e);
        }

        let after = file_ids(&item, schema);
        let released: Vec<String> = before.difference(&after).cloned().collect();
        self.discard_files(&released).await;

        tracing::info!(collection = %item.collection, item_id = %item.id, "Item updated");
        self.publish(&item.collection).await;
        Ok(item)
    }

    /// Soft delete marks the item deleted; hard delete releases its
    /// attachments and removes it from any state.
    pub async fn delete(
        &self,
        collection: &str,
        id: &str,
        actor: &str,
        mode: DeleteMode,
    ) -> Result<()> {
        let schema = self.ensure_collection(collection).await?;
        let mut item = self.require(collection, id).await?;

        match mode {
            DeleteMode::Soft => {
                let previous = item.clone();
                item.soft_delete(actor, self.clock.now())?;
                self.store.put(&item).await?;
                self.enqueue_or_revert(&item, QueueAction::Update, Some(&previous))
                    .await?;
                tracing::info!(collection = %collection, item_id = %id, "Item soft-deleted");
            }
            DeleteMode::Hard => {
                self.remove(schema, &item).await?;
                tracing::info!(collection = %collection, item_id = %id, "Item deleted");
            }
        }
        self.publish(collection).await;
        Ok(())
    }

    /// Bring a soft-deleted item back. Restoring an active item is
    /// `InvalidState`.
    pub async fn restore(&self, collection: &str, id: &str, actor: &str) -> Result<Item> {
        self.ensure_collection(collection).await?;
        let mut item = self.require(collection, id).await?;
        let previous = item.clone();
        item.restore(actor, self.clock.now())?;
        self.store.put(&item).await?;
        self.enqueue_or_revert(&item, QueueAction::Update, Some(&previous))
            .await?;

        tracing::info!(collection = %collection, item_id = %id, "Item restored");
        self.publish(collection).await;
        Ok(item)
    }

    /// Irreversibly remove a soft-deleted item.
    pub async fn purge(&self, collection: &str, id: &str) -> Result<()> {
        let schema = self.ensure_collection(collection).await?;
        let item = self.require(collection, id).await?;
        if item.is_active() {
            return Err(Error::invalid_state(id, "only deleted items can be purged").into());
        }
        self.remove(schema, &item).await?;

        tracing::info!(collection = %collection, item_id = %id, "Item purged");
        self.publish(collection).await;
        Ok(())
    }

    /// Remove the record, queue the removal, then release its blobs.
    async fn remove(&self, schema: &CollectionSchema, item: &Item) -> Result<()> {
        self.store.delete(&item.collection, &item.id).await?;
        self.enqueue_or_revert(item, QueueAction::Delete, Some(item))
            .await?;
        let files: Vec<String> = file_ids(item, schema).into_iter().collect();
        self.discard_files(&files).await;
        Ok(())
    }

    /// Queue a write that has just been persisted. When the entry cannot be
    /// recorded the store is put back to `previous` (the item is removed when
    /// there was none) and the enqueue error is returned.
    async fn enqueue_or_revert(
        &self,
        item: &Item,
        action: QueueAction,
        previous: Option<&Item>,
    ) -> Result<()> {
        let Some(replication) = &self.replication else {
            return Ok(());
        };
        let Err(e) = replication.enqueue_change(item, action).await else {
            return Ok(());
        };

        tracing::warn!(
            collection = %item.collection,
            item_id = %item.id,
            action = action.as_str(),
            error = %e,
            "Change not queued, reverting write"
        );
        let reverted = match previous {
            Some(previous) => self.store.put(previous).await,
            None => self.store.delete(&item.collection, &item.id).await.map(|_| ()),
        };
        if let Err(revert) = reverted {
            tracing::error!(
                collection = %item.collection,
                item_id = %item.id,
                error = %revert,
                "Write could not be reverted"
            );
        }
        Err(e)
    }

    async fn publish(&self, collection: &str) {
        if let Some(projections) = &self.projections {
            projections.refresh(collection).await;
        }
    }

    // ------------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------------

    fn check_file_fields(&self, schema: &CollectionSchema, files: &[(String, FileInput)]) -> Result<()> {
        for (field, _) in files {
            if !schema.file_fields().any(|f| f.name == *field) {
                return Err(Error::InvalidPayload(format!("{field} is not a file field")).into());
            }
        }
        Ok(())
    }

    /// Store each file and return the references to write. A failed write
    /// yields a failed reference instead of an error so the rest of the item
    /// is still saved.
    async fn store_files(&self, files: Vec<(String, FileInput)>) -> (Vec<(String, FileRef)>, Vec<String>) {
        let mut refs = Vec::with_capacity(files.len());
        let mut stored = Vec::new();

        for (field, input) in files {
            let (name, mime_type) = (input.name.clone(), input.mime_type.clone());
            let result = match &self.attachments {
                Some(attachments) => attachments.add_file(input).await,
                None => Err(RuntimeError::Attachment(
                    "no attachment store configured".to_string(),
                )),
            };
            let file_ref = match result {
                Ok(file) => {
                    stored.push(file.file_id.clone());
                    FileRef {
                        file_id: file.file_id,
                        name: file.name,
                        mime_type: file.mime_type,
                        size: file.size,
                        remote_path: None,
                        status: AttachmentStatus::Local,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!(field = %field, file = %name, error = %e, "Attachment not stored");
                    FileRef::failed(name, mime_type, e.to_string())
                }
            };
            refs.push((field, file_ref));
        }
        (refs, stored)
    }

    async fn discard_files(&self, file_ids: &[String]) {
        let Some(attachments) = &self.attachments else {
            return;
        };
        for file_id in file_ids {
            if let Err(e) = attachments.delete_file(file_id).await {
                tracing::warn!(file = %file_id, error = %e, "Attachment release failed");
            }
        }
    }
}

fn file_ids(item: &Item, schema: &CollectionSchema) -> HashSet<String> {
    item.file_refs(schema)
        .into_iter()
        .map(|(_, r)| r.file_id)
        .filter(|id| !id.is_empty())
        .collect()
}

fn merge_into(target: &mut Value, patch: &Value) {
    let (Value::Object(target), Value::Object(patch)) = (target, patch) else {
        return;
    };
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}
