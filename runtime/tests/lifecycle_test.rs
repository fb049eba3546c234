//! Lifecycle tests for the repository: create, update, soft delete, restore,
//! purge and hard delete, plus attachments, queueing and projections.

mod common;

use async_trait::async_trait;
use common::{todo_schema, Context, Recorder, START};
use harbor_engine::{
    AttachmentStatus, Checkpoint, Comparison, ErrorKind, FileRef, IndexDef, Item, KeyRange,
    ManualClock, ProjectionStatus, QueueAction, QueueEntry, QuerySpec, SchemaChange,
    SchemaVersion, UpdateKind,
};
use harbor_runtime::{
    AttachmentStore, CreateInput, DeleteMode, FileInput, LocalStore, MemoryAttachmentStore,
    MemoryBackend, MemoryRemote, MemoryStorage, ProjectionHub, QueryEngine, ReplicationEngine,
    Repository, Store, SyncStateStore, UpdateInput,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

async fn context() -> Context {
    Context::new(Arc::new(MemoryRemote::new()), Arc::new(MemoryStorage::new())).await
}

fn todo(title: &str) -> CreateInput {
    CreateInput::new("todos", "alice", json!({ "title": title, "status": "open" }))
}

fn file(name: &str, bytes: &[u8]) -> FileInput {
    FileInput::new(name, "text/plain", bytes.to_vec())
}

// ============================================================================
// Create / read
// ============================================================================

#[tokio::test]
async fn create_stamps_metadata() {
    let ctx = context().await;
    let item = ctx.repo.create(todo("Buy milk")).await.unwrap();

    assert!(!item.id.is_empty());
    assert_eq!(item.created_at, START);
    assert_eq!(item.updated_at, START);
    assert_eq!(item.created_by.as_deref(), Some("alice"));
    assert_eq!(item.update_log.len(), 1);
    assert_eq!(item.update_log[0].kind, UpdateKind::Create);

    let fetched = ctx.repo.get("todos", &item.id).await.unwrap().unwrap();
    assert_eq!(fetched, item);
}

#[tokio::test]
async fn ids_are_unique() {
    let ctx = context().await;
    let a = ctx.repo.create(todo("a")).await.unwrap();
    let b = ctx.repo.create(todo("b")).await.unwrap();
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn get_missing_is_none() {
    let ctx = context().await;
    assert!(ctx.repo.get("todos", "nope").await.unwrap().is_none());
}

#[tokio::test]
async fn create_validates_payload() {
    let ctx = context().await;

    let err = ctx
        .repo
        .create(CreateInput::new("todos", "alice", json!({ "status": "open" })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = ctx
        .repo
        .create(CreateInput::new("todos", "alice", json!({ "title": 42 })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = ctx
        .repo
        .create(CreateInput::new("todos", "alice", json!(["not", "an", "object"])))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn unknown_collection_is_not_found() {
    let ctx = context().await;
    let err = ctx
        .repo
        .create(CreateInput::new("ghosts", "alice", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn unique_field_rejects_duplicates() {
    let ctx = context().await;
    let user = |name: &str| {
        CreateInput::new(
            "users",
            "admin",
            json!({ "name": name, "email": "same@example.com" }),
        )
    };
    ctx.repo.create(user("Ann")).await.unwrap();
    let err = ctx.repo.create(user("Bob")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageFailure);
}

// ============================================================================
// Update
// ============================================================================

#[tokio::test]
async fn update_merges_and_logs_once() {
    let ctx = context().await;
    let item = ctx.repo.create(todo("Buy milk")).await.unwrap();

    ctx.clock.advance(10);
    let updated = ctx
        .repo
        .update(UpdateInput::new(
            "todos",
            &item.id,
            "bob",
            json!({ "status": "done", "priority": 3 }),
        ))
        .await
        .unwrap();

    assert_eq!(updated.data["title"], "Buy milk");
    assert_eq!(updated.data["status"], "done");
    assert_eq!(updated.data["priority"], 3);
    assert_eq!(updated.updated_at, START + 10);
    assert_eq!(updated.update_log.len(), 2);
    let entry = &updated.update_log[1];
    assert_eq!(entry.actor, "bob");
    assert_eq!(entry.kind, UpdateKind::Update);
    assert_eq!(entry.before["status"], "open");
    assert_eq!(entry.after["status"], "done");
}

#[tokio::test]
async fn update_null_clears_field() {
    let ctx = context().await;
    let item = ctx.repo.create(todo("Buy milk")).await.unwrap();
    let updated = ctx
        .repo
        .update(UpdateInput::new("todos", &item.id, "alice", json!({ "status": null })))
        .await
        .unwrap();
    assert!(updated.data.get("status").is_none());
}

#[tokio::test]
async fn update_cannot_clear_required_field() {
    let ctx = context().await;
    let item = ctx.repo.create(todo("Buy milk")).await.unwrap();
    let err = ctx
        .repo
        .update(UpdateInput::new("todos", &item.id, "alice", json!({ "title": null })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let stored = ctx.repo.get("todos", &item.id).await.unwrap().unwrap();
    assert_eq!(stored.update_log.len(), 1);
}

#[tokio::test]
async fn update_missing_is_not_found() {
    let ctx = context().await;
    let err = ctx
        .repo
        .update(UpdateInput::new("todos", "nope", "alice", json!({ "status": "x" })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn backwards_clock_never_lowers_updated_at() {
    let ctx = context().await;
    let item = ctx.repo.create(todo("Buy milk")).await.unwrap();

    ctx.clock.set(START - 60_000);
    let updated = ctx
        .repo
        .update(UpdateInput::new("todos", &item.id, "alice", json!({ "status": "done" })))
        .await
        .unwrap();
    assert_eq!(updated.updated_at, START);
}

// ============================================================================
// Soft delete / restore / purge / hard delete
// ============================================================================

#[tokio::test]
async fn soft_delete_hides_item() {
    let ctx = context().await;
    let item = ctx.repo.create(todo("Buy milk")).await.unwrap();

    ctx.clock.advance(5);
    ctx.repo
        .delete("todos", &item.id, "bob", DeleteMode::Soft)
        .await
        .unwrap();

    assert!(ctx.repo.get("todos", &item.id).await.unwrap().is_none());
    let deleted = ctx
        .repo
        .get_including_deleted("todos", &item.id)
        .await
        .unwrap()
        .unwrap();
    assert!(deleted.is_deleted);
    assert_eq!(deleted.deleted_at, Some(START + 5));
    assert_eq!(deleted.deleted_by.as_deref(), Some("bob"));
    assert_eq!(deleted.updated_at, START + 5);
    assert_eq!(deleted.update_log.len(), 2);

    let result = QueryEngine::new(ctx.store())
        .query(&QuerySpec::new("todos"))
        .await
        .unwrap();
    assert_eq!(result.total_count, 0);
}

#[tokio::test]
async fn soft_delete_twice_is_invalid() {
    let ctx = context().await;
    let item = ctx.repo.create(todo("Buy milk")).await.unwrap();
    ctx.repo
        .delete("todos", &item.id, "bob", DeleteMode::Soft)
        .await
        .unwrap();
    let err = ctx
        .repo
        .delete("todos", &item.id, "bob", DeleteMode::Soft)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn update_deleted_is_invalid() {
    let ctx = context().await;
    let item = ctx.repo.create(todo("Buy milk")).await.unwrap();
    ctx.repo
        .delete("todos", &item.id, "bob", DeleteMode::Soft)
        .await
        .unwrap();
    let err = ctx
        .repo
        .update(UpdateInput::new("todos", &item.id, "bob", json!({ "status": "x" })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn restore_brings_item_back() {
    let ctx = context().await;
    let item = ctx.repo.create(todo("Buy milk")).await.unwrap();
    ctx.clock.advance(5);
    ctx.repo
        .delete("todos", &item.id, "bob", DeleteMode::Soft)
        .await
        .unwrap();
    ctx.clock.advance(5);

    let restored = ctx.repo.restore("todos", &item.id, "carol").await.unwrap();
    assert!(restored.is_active());
    assert_eq!(restored.deleted_at, None);
    assert_eq!(restored.deleted_by, None);
    assert_eq!(restored.updated_at, START + 10);
    assert_eq!(restored.update_log.len(), 3);
    assert_eq!(restored.update_log[2].kind, UpdateKind::Restore);
    assert!(ctx.repo.get("todos", &item.id).await.unwrap().is_some());
}

#[tokio::test]
async fn restore_active_is_invalid() {
    let ctx = context().await;
    let item = ctx.repo.create(todo("Buy milk")).await.unwrap();
    let err = ctx
        .repo
        .restore("todos", &item.id, "bob")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let stored = ctx.repo.get("todos", &item.id).await.unwrap().unwrap();
    assert_eq!(stored.update_log.len(), 1);
}

#[tokio::test]
async fn purge_requires_soft_delete() {
    let ctx = context().await;
    let item = ctx.repo.create(todo("Buy milk")).await.unwrap();

    let err = ctx.repo.purge("todos", &item.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    ctx.repo
        .delete("todos", &item.id, "bob", DeleteMode::Soft)
        .await
        .unwrap();
    ctx.repo.purge("todos", &item.id).await.unwrap();

    assert!(ctx
        .repo
        .get_including_deleted("todos", &item.id)
        .await
        .unwrap()
        .is_none());
    let err = ctx.repo.purge("todos", &item.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn hard_delete_works_from_any_state() {
    let ctx = context().await;
    let active = ctx.repo.create(todo("active")).await.unwrap();
    let deleted = ctx.repo.create(todo("deleted")).await.unwrap();
    ctx.repo
        .delete("todos", &deleted.id, "bob", DeleteMode::Soft)
        .await
        .unwrap();

    for id in [&active.id, &deleted.id] {
        ctx.repo
            .delete("todos", id, "bob", DeleteMode::Hard)
            .await
            .unwrap();
        assert!(ctx
            .repo
            .get_including_deleted("todos", id)
            .await
            .unwrap()
            .is_none());
    }
}

// ============================================================================
// Replication queue
// ============================================================================

#[tokio::test]
async fn mutations_are_queued_in_order() {
    let ctx = context().await;
    let item = ctx.repo.create(todo("Buy milk")).await.unwrap();
    ctx.repo
        .update(UpdateInput::new("todos", &item.id, "alice", json!({ "status": "done" })))
        .await
        .unwrap();
    ctx.repo
        .delete("todos", &item.id, "alice", DeleteMode::Soft)
        .await
        .unwrap();
    ctx.repo.restore("todos", &item.id, "alice").await.unwrap();
    ctx.repo
        .delete("todos", &item.id, "alice", DeleteMode::Hard)
        .await
        .unwrap();

    let entries = ctx.store.queue_entries(Some("todos")).await.unwrap();
    let actions: Vec<QueueAction> = entries.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            QueueAction::Create,
            QueueAction::Update,
            QueueAction::Update,
            QueueAction::Update,
            QueueAction::Delete,
        ]
    );
    assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(entries.iter().all(|e| e.item_id == item.id));
    assert_eq!(entries[1].snapshot.data["status"], "done");
    assert!(entries[2].snapshot.is_deleted);
}

#[tokio::test]
async fn failed_mutation_is_not_queued() {
    let ctx = context().await;
    let _ = ctx
        .repo
        .create(CreateInput::new("todos", "alice", json!({})))
        .await
        .unwrap_err();
    assert!(ctx.store.queue_entries(None).await.unwrap().is_empty());
}

/// Memory store whose queue can be switched to reject new entries.
#[derive(Default)]
struct JammedQueue {
    inner: MemoryBackend,
    jammed: AtomicBool,
}

#[async_trait]
impl LocalStore for JammedQueue {
    async fn ensure(
        &self,
        collection: &str,
        primary_key_path: &str,
        indexes: &[IndexDef],
    ) -> harbor_runtime::Result<SchemaChange> {
        self.inner.ensure(collection, primary_key_path, indexes).await
    }

    async fn schema_version(&self) -> harbor_runtime::Result<SchemaVersion> {
        self.inner.schema_version().await
    }

    async fn index_defs(&self, collection: &str) -> harbor_runtime::Result<Vec<IndexDef>> {
        self.inner.index_defs(collection).await
    }

    async fn put(&self, item: &Item) -> harbor_runtime::Result<()> {
        self.inner.put(item).await
    }

    async fn get(&self, collection: &str, id: &str) -> harbor_runtime::Result<Option<Item>> {
        self.inner.get(collection, id).await
    }

    async fn delete(&self, collection: &str, id: &str) -> harbor_runtime::Result<bool> {
        self.inner.delete(collection, id).await
    }

    async fn get_all(&self, collection: &str) -> harbor_runtime::Result<Vec<Item>> {
        self.inner.get_all(collection).await
    }

    async fn get_all_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> harbor_runtime::Result<Vec<Item>> {
        self.inner.get_all_by_index(collection, index, value).await
    }

    async fn get_by_range(
        &self,
        collection: &str,
        index: &str,
        range: &KeyRange,
    ) -> harbor_runtime::Result<Vec<Item>> {
        self.inner.get_by_range(collection, index, range).await
    }

    async fn count(&self, collection: &str) -> harbor_runtime::Result<usize> {
        self.inner.count(collection).await
    }
}

#[async_trait]
impl SyncStateStore for JammedQueue {
    async fn enqueue(&self, entry: QueueEntry) -> harbor_runtime::Result<QueueEntry> {
        if self.jammed.load(Ordering::SeqCst) {
            return Err(harbor_engine::Error::Storage("queue is full".to_string()).into());
        }
        self.inner.enqueue(entry).await
    }

    async fn queue_entries(
        &self,
        collection: Option<&str>,
    ) -> harbor_runtime::Result<Vec<QueueEntry>> {
        self.inner.queue_entries(collection).await
    }

    async fn update_queue_entry(&self, entry: &QueueEntry) -> harbor_runtime::Result<()> {
        self.inner.update_queue_entry(entry).await
    }

    async fn remove_queue_entry(&self, id: &str) -> harbor_runtime::Result<bool> {
        self.inner.remove_queue_entry(id).await
    }

    async fn checkpoint(&self, collection: &str) -> harbor_runtime::Result<Checkpoint> {
        self.inner.checkpoint(collection).await
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> harbor_runtime::Result<()> {
        self.inner.set_checkpoint(checkpoint).await
    }
}

struct Jammed {
    store: Arc<JammedQueue>,
    attachments: Arc<MemoryAttachmentStore>,
    repo: Repository,
}

async fn jammed() -> Jammed {
    let store = Arc::new(JammedQueue::default());
    let attachments = Arc::new(MemoryAttachmentStore::new());
    let schema = Arc::new(todo_schema());
    let clock = Arc::new(ManualClock::new(START));
    let replication = Arc::new(
        ReplicationEngine::new(store.clone(), schema.clone(), Arc::new(MemoryRemote::new()))
            .with_clock(clock.clone()),
    );
    let repo = Repository::new(store.clone(), schema)
        .with_clock(clock)
        .with_attachments(attachments.clone())
        .with_replication(replication);
    repo.ensure_schema().await.unwrap();
    Jammed {
        store,
        attachments,
        repo,
    }
}

#[tokio::test]
async fn unqueued_create_is_reverted() {
    let ctx = jammed().await;
    ctx.store.jammed.store(true, Ordering::SeqCst);

    let err = ctx
        .repo
        .create(todo("lost").with_file("attachment", file("notes.txt", b"hello")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageFailure);

    assert_eq!(ctx.store.count("todos").await.unwrap(), 0);
    assert!(ctx.store.queue_entries(None).await.unwrap().is_empty());
    assert!(ctx.attachments.is_empty());
}

#[tokio::test]
async fn unqueued_update_and_delete_are_reverted() {
    let ctx = jammed().await;
    let item = ctx
        .repo
        .create(todo("kept").with_file("attachment", file("notes.txt", b"hello")))
        .await
        .unwrap();
    ctx.store.jammed.store(true, Ordering::SeqCst);

    ctx.repo
        .update(UpdateInput::new("todos", &item.id, "alice", json!({ "status": "done" })))
        .await
        .unwrap_err();
    ctx.repo
        .delete("todos", &item.id, "alice", DeleteMode::Soft)
        .await
        .unwrap_err();
    ctx.repo
        .delete("todos", &item.id, "alice", DeleteMode::Hard)
        .await
        .unwrap_err();

    let stored = ctx.repo.get("todos", &item.id).await.unwrap().unwrap();
    assert_eq!(stored, item);
    assert_eq!(ctx.attachments.len(), 1);
    assert_eq!(ctx.store.queue_entries(None).await.unwrap().len(), 1);

    // Once the queue accepts entries again the same writes go through
    ctx.store.jammed.store(false, Ordering::SeqCst);
    ctx.repo
        .delete("todos", &item.id, "alice", DeleteMode::Hard)
        .await
        .unwrap();
    assert!(ctx.repo.get_including_deleted("todos", &item.id).await.unwrap().is_none());
    assert!(ctx.attachments.is_empty());
    assert_eq!(ctx.store.queue_entries(None).await.unwrap().len(), 2);
}

// ============================================================================
// Attachments
// ============================================================================

#[tokio::test]
async fn file_field_stores_reference() {
    let ctx = context().await;
    let item = ctx
        .repo
        .create(todo("with file").with_file("attachment", file("notes.txt", b"hello")))
        .await
        .unwrap();

    let file_ref = FileRef::from_value(&item.data["attachment"]).unwrap();
    assert!(!file_ref.file_id.is_empty());
    assert_eq!(file_ref.name, "notes.txt");
    assert_eq!(file_ref.size, 5);
    assert_eq!(file_ref.status, AttachmentStatus::Local);
    assert_eq!(ctx.attachments.len(), 1);

    let entries = ctx.store.queue_entries(None).await.unwrap();
    assert_eq!(entries[0].pending_attachments.len(), 1);
    assert_eq!(entries[0].pending_attachments[0].file_id, file_ref.file_id);
}

#[tokio::test]
async fn failed_attachment_keeps_item() {
    let ctx = context().await;
    ctx.attachments.set_fail_writes(true);

    let item = ctx
        .repo
        .create(todo("with file").with_file("attachment", file("notes.txt", b"hello")))
        .await
        .unwrap();

    let file_ref = FileRef::from_value(&item.data["attachment"]).unwrap();
    assert_eq!(file_ref.status, AttachmentStatus::Failed);
    assert!(file_ref.file_id.is_empty());
    assert!(file_ref.error.is_some());
    assert_eq!(item.data["title"], "with file");
    assert!(ctx.repo.get("todos", &item.id).await.unwrap().is_some());
}

#[tokio::test]
async fn file_on_plain_field_is_rejected() {
    let ctx = context().await;
    let err = ctx
        .repo
        .create(todo("bad").with_file("title", file("x.txt", b"x")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(ctx.attachments.is_empty());
}

#[tokio::test]
async fn replacing_file_releases_old_blob() {
    let ctx = context().await;
    let item = ctx
        .repo
        .create(todo("with file").with_file("attachment", file("v1.txt", b"one")))
        .await
        .unwrap();
    let old = FileRef::from_value(&item.data["attachment"]).unwrap();

    let updated = ctx
        .repo
        .update(
            UpdateInput::new("todos", &item.id, "alice", json!({}))
                .with_file("attachment", file("v2.txt", b"two")),
        )
        .await
        .unwrap();
    let new = FileRef::from_value(&updated.data["attachment"]).unwrap();

    assert_ne!(old.file_id, new.file_id);
    assert_eq!(ctx.attachments.len(), 1);
    assert!(!ctx.attachments.has_file(&old.file_id).await);
}

#[tokio::test]
async fn purge_releases_attachments() {
    let ctx = context().await;
    let item = ctx
        .repo
        .create(todo("with file").with_file("attachment", file("notes.txt", b"hello")))
        .await
        .unwrap();
    ctx.repo
        .delete("todos", &item.id, "alice", DeleteMode::Soft)
        .await
        .unwrap();
    assert_eq!(ctx.attachments.len(), 1);

    ctx.repo.purge("todos", &item.id).await.unwrap();
    assert!(ctx.attachments.is_empty());
}

// ============================================================================
// Projections
// ============================================================================

#[tokio::test]
async fn projections_follow_mutations() {
    let ctx = context().await;
    let hub = Arc::new(ProjectionHub::new(QueryEngine::new(ctx.store())));
    let repo = Repository::new(ctx.store(), Arc::new(common::todo_schema()))
        .with_projections(hub.clone());

    let recorder = Arc::new(Recorder::default());
    hub.subscribe(QuerySpec::new("todos"), recorder.clone()).await;
    let initial = recorder.last().unwrap();
    assert_eq!(initial.status, ProjectionStatus::Ready);
    assert_eq!(initial.total_count, 0);

    let item = repo.create(todo("Buy milk")).await.unwrap();
    let after_create = recorder.last().unwrap();
    assert_eq!(after_create.total_count, 1);
    assert_eq!(after_create.items[0].id, item.id);

    repo.delete("todos", &item.id, "alice", DeleteMode::Soft)
        .await
        .unwrap();
    assert_eq!(recorder.last().unwrap().total_count, 0);
    assert_eq!(recorder.count(), 3);
}

#[tokio::test]
async fn projection_reports_query_errors() {
    let ctx = context().await;
    let hub = ProjectionHub::new(QueryEngine::new(ctx.store()));
    let recorder = Arc::new(Recorder::default());
    let id = hub
        .subscribe(QuerySpec::new("ghosts"), recorder.clone())
        .await;

    let snapshot = recorder.last().unwrap();
    assert_eq!(snapshot.status, ProjectionStatus::Error);
    assert!(snapshot.last_error.is_some());
    assert!(hub.unsubscribe(id));
    assert_eq!(hub.subscription_count(), 0);
}

#[tokio::test]
async fn declared_collection_projects_empty_before_first_write() {
    let store: Arc<dyn Store> = Arc::new(MemoryBackend::new());
    let schema = Arc::new(todo_schema());
    let hub = Arc::new(ProjectionHub::new(
        QueryEngine::new(store.clone()).with_schema(schema.clone()),
    ));
    let recorder = Arc::new(Recorder::default());
    hub.subscribe(QuerySpec::new("todos"), recorder.clone()).await;

    let initial = recorder.last().unwrap();
    assert_eq!(initial.status, ProjectionStatus::Ready);
    assert_eq!(initial.total_count, 0);

    let repo = Repository::new(store, schema).with_projections(hub.clone());
    repo.create(todo("first")).await.unwrap();
    assert_eq!(recorder.last().unwrap().total_count, 1);
}

#[tokio::test]
async fn queries_publish_to_matching_observers() {
    let ctx = context().await;
    let hub = ProjectionHub::new(QueryEngine::new(ctx.store()));
    let open = Arc::new(Recorder::default());
    let everything = Arc::new(Recorder::default());
    let open_spec = QuerySpec::new("todos").filter("status", Comparison::Equals(json!("open")));
    hub.subscribe(open_spec.clone(), open.clone()).await;
    hub.subscribe(QuerySpec::new("todos"), everything.clone()).await;

    // Written behind the hub's back: only a query brings observers up to date
    ctx.repo.create(todo("Buy milk")).await.unwrap();
    assert_eq!(open.last().unwrap().total_count, 0);

    let result = hub.query(&open_spec).await.unwrap();
    assert_eq!(result.total_count, 1);
    assert_eq!(open.count(), 2);
    assert_eq!(open.last().unwrap().total_count, 1);
    assert_eq!(everything.count(), 1);

    let err = hub.query(&QuerySpec::new("ghosts")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(everything.count(), 1);
}
