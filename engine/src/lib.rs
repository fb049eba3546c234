//! # Harbor Engine
//!
//! The deterministic core of a local-first sync layer.
//!
//! This crate holds everything that can be decided without IO: the item
//! model and its lifecycle, schemas and secondary indexes, an in-memory
//! local store, query evaluation, conflict resolution, replication queue and
//! checkpoint bookkeeping, and the leader-election protocol.
//!
//! ## Design Principles
//!
//! - **No IO**: no files, no network, no clock reads, no randomness
//! - **Deterministic**: time and jitter are passed in by the caller
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Items
//!
//! An [`Item`] is a JSON object plus control metadata: creation and update
//! stamps, an append-only update log, soft-delete fields and the origin of
//! the last write. `updatedAt` never goes backwards and is the only input to
//! conflict resolution.
//!
//! ### Local store
//!
//! [`MemoryStore`] keeps items per collection with [`SecondaryIndex`]es that
//! are created on demand through [`MemoryStore::ensure`]. Upgrades are
//! staged: a failing backfill leaves the previous schema in place.
//!
//! ### Queries
//!
//! [`QuerySpec`] describes filters, search, sort and paging. [`plan`] picks
//! an index lookup or a full scan; [`execute`] does the rest in memory.
//!
//! ### Replication
//!
//! [`QueueEntry`] records a pending local mutation, [`Checkpoint`] the pull
//! cursor of a collection, and [`decide`] merges a pulled item with local
//! state under a [`ConflictPolicy`].
//!
//! ### Leader election
//!
//! [`Election`] is the protocol state machine; the caller owns the timers
//! and the broadcast channel.
//!
//! ## Quick Start
//!
//! ```rust
//! use harbor_engine::{
//!     execute, plan, Comparison, IndexDef, Item, MemoryStore, QueryPlan, QuerySpec,
//!     PRIMARY_KEY_PATH,
//! };
//! use serde_json::json;
//!
//! // 1. Declare a collection with an index
//! let mut store = MemoryStore::new();
//! store
//!     .ensure("users", PRIMARY_KEY_PATH, &[IndexDef::new("city")])
//!     .unwrap();
//!
//! // 2. Store items
//! store
//!     .put(Item::new("u1", "users", json!({"city": "Oslo"}), "me", 1000))
//!     .unwrap();
//! store
//!     .put(Item::new("u2", "users", json!({"city": "Bergen"}), "me", 1000))
//!     .unwrap();
//!
//! // 3. Query through the index
//! let spec = QuerySpec::new("users").filter("city", Comparison::Equals(json!("oslo")));
//! let defs = store.index_defs("users").unwrap();
//! assert!(matches!(plan(&spec, &defs), QueryPlan::IndexLookup { .. }));
//!
//! let candidates = store.get_all_by_index("users", "city", &json!("oslo")).unwrap();
//! let result = execute(candidates, &spec);
//! assert_eq!(result.total_count, 1);
//! assert_eq!(result.items[0].id, "u1");
//! ```
//!
//! ## Persistence
//!
//! Use [`MemoryStore::export_state`] and [`MemoryStore::import_state`] with
//! [`StoreSnapshot`] for persistence. Snapshots serialize to JSON with
//! deterministic ordering.

pub mod clock;
pub mod conflict;
pub mod election;
pub mod error;
pub mod index;
pub mod item;
pub mod projection;
pub mod query;
pub mod replication;
pub mod schema;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use clock::{stamp_after, Clock, ManualClock};
pub use conflict::{decide, Conflict, ConflictPolicy, LastWriteWins, PullDecision, Resolution, TieBreak};
pub use election::{Election, ElectionAction, ElectionMessage, ElectionTimings, Role};
pub use error::{Error, ErrorKind};
pub use index::{compare_numbers, IndexKey, KeyRange, RangeBound, SecondaryIndex};
pub use item::{data_path, AttachmentStatus, FileRef, Item, Origin, UpdateKind, UpdateLogEntry};
pub use projection::{ProjectionObserver, ProjectionSnapshot, ProjectionStatus};
pub use query::{
    execute, plan, sort_items, Comparison, Predicate, QueryPlan, QueryResult, QuerySpec, Search,
    SortDirection, SortKey,
};
pub use replication::{
    Checkpoint, PendingAttachment, QueueAction, QueueEntry, QueueStatus, RemoteChange,
};
pub use schema::{
    validate_index_set, CollectionSchema, FieldDef, FieldType, IndexDef, Schema, PRIMARY_KEY_PATH,
};
pub use snapshot::{CollectionSnapshot, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{CollectionState, MemoryStore, SchemaChange};

/// Type aliases for clarity
pub type ItemId = String;
pub type CollectionName = String;
pub type ActorId = String;
pub type InstanceId = String;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
pub type SchemaVersion = u32;
