//! Harbor demo - runs one local-first context against an in-memory remote.
//!
//! Opens the SQLite store from `HARBOR_DATABASE_URL`, joins a leader election,
//! starts replication, performs a few lifecycle operations and a query, then
//! shuts everything down.

use harbor_engine::{
    CollectionSchema, Comparison, FieldDef, FieldType, QuerySpec, Schema, SortDirection,
};
use harbor_runtime::{
    election_channel, Config, CreateInput, DeleteMode, LeaderElector, Leadership,
    MemoryAttachmentStore, MemoryRemote, MemoryStorage, ProjectionHub, QueryEngine,
    ReplicationEngine, Repository, SqliteStore, UpdateInput,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn demo_schema() -> Schema {
    Schema::new(1).with_collection(CollectionSchema::new(
        "todos",
        vec![
            FieldDef::required("title", FieldType::String),
            FieldDef::optional("status", FieldType::String).indexed(),
            FieldDef::optional("priority", FieldType::Int),
            FieldDef::optional("attachment", FieldType::File),
        ],
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harbor_runtime=debug,harbor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(database = %config.database_url, "Opening local store");
    let store = Arc::new(SqliteStore::open(&config.database_url).await?);
    let schema = Arc::new(demo_schema());

    // Election: a single context, so it leads once the settle window passes
    let channel = election_channel(64);
    let elector = Arc::new(LeaderElector::start(channel, config.election));

    let attachments = Arc::new(MemoryAttachmentStore::new());
    let queries = QueryEngine::new(store.clone()).with_schema(schema.clone());
    let projections = Arc::new(ProjectionHub::new(queries.clone()));

    let replication = Arc::new(
        ReplicationEngine::new(store.clone(), schema.clone(), Arc::new(MemoryRemote::new()))
            .with_attachments(Arc::new(MemoryStorage::new()), attachments.clone())
            .with_leadership(elector.clone())
            .with_projections(projections.clone())
            .with_options(config.replication.clone()),
    );

    let repo = Repository::new(store.clone(), schema)
        .with_attachments(attachments)
        .with_replication(replication.clone())
        .with_projections(projections);
    repo.ensure_schema().await?;

    replication.start().await?;

    // CRUD
    let milk = repo
        .create(CreateInput::new(
            "todos",
            "demo",
            json!({ "title": "Buy milk", "status": "open", "priority": 2 }),
        ))
        .await?;
    let report = repo
        .create(CreateInput::new(
            "todos",
            "demo",
            json!({ "title": "Write report", "status": "open", "priority": 1 }),
        ))
        .await?;
    repo.update(UpdateInput::new(
        "todos",
        &milk.id,
        "demo",
        json!({ "status": "done" }),
    ))
    .await?;
    repo.delete("todos", &report.id, "demo", DeleteMode::Soft)
        .await?;
    repo.restore("todos", &report.id, "demo").await?;

    // Query
    let spec = QuerySpec::new("todos")
        .filter("status", Comparison::Equals(json!("open")))
        .sort_by("priority", SortDirection::Asc);
    tracing::info!(plan = ?queries.explain(&spec).await?, "Query plan");
    let result = queries.query(&spec).await?;
    for item in &result.items {
        tracing::info!(id = %item.id, title = %item.data["title"], "Open todo");
    }

    // Give the leader a moment, then push whatever is still queued
    tokio::time::sleep(Duration::from_millis(
        config.election.settle + config.election.jitter + 100,
    ))
    .await;
    tracing::info!(leader = elector.is_leader(), "Election settled");
    let sync = replication.sync_all().await?;
    tracing::info!(
        pushed = sync.push.pushed,
        failed = sync.push.failed,
        "Sync finished"
    );

    // Shutdown
    replication.stop().await;
    elector.stop().await;
    store.close().await;
    tracing::info!("Harbor demo finished");

    Ok(())
}
