//! # Harbor Runtime
//!
//! The async shell around [`harbor_engine`]: persistent local stores, the
//! CRUD/lifecycle [`Repository`], the [`QueryEngine`], the
//! [`ReplicationEngine`] and the [`LeaderElector`].
//!
//! ## Wiring
//!
//! ```rust,no_run
//! use harbor_engine::{CollectionSchema, FieldDef, FieldType, QuerySpec, Schema};
//! use harbor_runtime::{
//!     CreateInput, MemoryRemote, QueryEngine, ReplicationEngine, Repository, SqliteStore,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> harbor_runtime::Result<()> {
//! let schema = Arc::new(Schema::new(1).with_collection(CollectionSchema::new(
//!     "todos",
//!     vec![FieldDef::required("title", FieldType::String).indexed()],
//! )));
//! let store = Arc::new(SqliteStore::open("sqlite::memory:").await?);
//!
//! let replication = Arc::new(ReplicationEngine::new(
//!     store.clone(),
//!     schema.clone(),
//!     Arc::new(MemoryRemote::new()),
//! ));
//! let repo = Repository::new(store.clone(), schema).with_replication(replication.clone());
//!
//! repo.create(CreateInput::new("todos", "alice", json!({ "title": "Buy milk" })))
//!     .await?;
//! let result = QueryEngine::new(store).query(&QuerySpec::new("todos")).await?;
//! assert_eq!(result.total_count, 1);
//!
//! replication.sync_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod attachments;
pub mod clock;
pub mod config;
pub mod election;
pub mod error;
pub mod projection;
pub mod query;
pub mod remote;
pub mod replication;
pub mod repository;
pub mod store;

pub use attachments::{AttachmentStore, FileInput, MemoryAttachmentStore, StoredFile};
pub use clock::SystemClock;
pub use config::{Config, ConfigError, ReplicationOptions};
pub use election::{election_channel, AlwaysLeader, LeaderElector, Leadership, LeadershipState};
pub use error::{Result, RuntimeError};
pub use projection::{ProjectionHub, SubscriptionId};
pub use query::QueryEngine;
pub use remote::{
    ChangeFeed, MemoryRemote, MemoryStorage, PullResponse, PushResponse, RemoteBackend,
    StorageStrategy,
};
pub use replication::{
    PullReport, PushReport, ReplicationEngine, ReplicationState, ReplicationStatus, SyncReport,
};
pub use repository::{CreateInput, DeleteMode, Repository, UpdateInput};
pub use store::{LocalStore, MemoryBackend, SqliteStore, Store, SyncStateStore};
