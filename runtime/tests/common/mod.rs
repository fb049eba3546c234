//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)]

use harbor_engine::{
    CollectionSchema, FieldDef, FieldType, ManualClock, ProjectionObserver, ProjectionSnapshot,
    Schema,
};
use harbor_runtime::{
    AlwaysLeader, Leadership, MemoryAttachmentStore, MemoryBackend, MemoryRemote, MemoryStorage,
    ReplicationEngine, ReplicationOptions, Repository, Store,
};
use std::sync::{Arc, Mutex};

pub const START: u64 = 1_700_000_000_000;

pub fn todo_schema() -> Schema {
    Schema::new(1)
        .with_collection(CollectionSchema::new(
            "todos",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("status", FieldType::String).indexed(),
                FieldDef::optional("priority", FieldType::Int),
                FieldDef::optional("attachment", FieldType::File),
            ],
        ))
        .with_collection(CollectionSchema::new(
            "users",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::required("email", FieldType::String).unique(),
            ],
        ))
}

/// Observer recording every snapshot it receives.
#[derive(Default)]
pub struct Recorder {
    pub snapshots: Mutex<Vec<ProjectionSnapshot>>,
}

impl Recorder {
    pub fn last(&self) -> Option<ProjectionSnapshot> {
        self.snapshots.lock().unwrap().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }
}

impl ProjectionObserver for Recorder {
    fn on_snapshot(&self, snapshot: &ProjectionSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot.clone());
    }
}

/// One local context: store, attachments, replication and repository wired
/// against a remote that may be shared with other contexts.
pub struct Context {
    pub store: Arc<MemoryBackend>,
    pub clock: Arc<ManualClock>,
    pub attachments: Arc<MemoryAttachmentStore>,
    pub replication: Arc<ReplicationEngine>,
    pub repo: Repository,
}

impl Context {
    pub async fn new(remote: Arc<MemoryRemote>, storage: Arc<MemoryStorage>) -> Self {
        Self::with_options(remote, storage, ReplicationOptions::default()).await
    }

    pub async fn with_options(
        remote: Arc<MemoryRemote>,
        storage: Arc<MemoryStorage>,
        options: ReplicationOptions,
    ) -> Self {
        Self::build(remote, storage, options, Arc::new(AlwaysLeader)).await
    }

    pub async fn build(
        remote: Arc<MemoryRemote>,
        storage: Arc<MemoryStorage>,
        options: ReplicationOptions,
        leadership: Arc<dyn Leadership>,
    ) -> Self {
        let store = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(START));
        let attachments = Arc::new(MemoryAttachmentStore::new());
        let schema = Arc::new(todo_schema());

        let replication = Arc::new(
            ReplicationEngine::new(store.clone(), schema.clone(), remote)
                .with_attachments(storage, attachments.clone())
                .with_clock(clock.clone())
                .with_leadership(leadership)
                .with_options(options),
        );
        let repo = Repository::new(store.clone(), schema)
            .with_clock(clock.clone())
            .with_attachments(attachments.clone())
            .with_replication(replication.clone());
        repo.ensure_schema().await.unwrap();

        Self {
            store,
            clock,
            attachments,
            replication,
            repo,
        }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }
}
