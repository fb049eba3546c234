//! Query engine over a [`Store`].
//!
//! Planning and evaluation are pure and live in the engine crate; this layer
//! picks the candidate fetch the plan asks for.

use crate::error::Result;
use crate::store::Store;
use dashmap::DashSet;
use harbor_engine::{
    execute, plan, CollectionName, KeyRange, QueryPlan, QueryResult, QuerySpec, Schema,
    PRIMARY_KEY_PATH,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn Store>,
    schema: Option<Arc<Schema>>,
    ensured: Arc<DashSet<CollectionName>>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            schema: None,
            ensured: Arc::new(DashSet::new()),
        }
    }

    /// Prepare storage for collections declared in `schema` on first query,
    /// so a declared but still empty collection reads as empty.
    pub fn with_schema(mut self, schema: Arc<Schema>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// The plan `query` would run for `spec`.
    pub async fn explain(&self, spec: &QuerySpec) -> Result<QueryPlan> {
        self.prepare(&spec.collection).await?;
        let indexes = self.store.index_defs(&spec.collection).await?;
        Ok(plan(spec, &indexes))
    }

    async fn prepare(&self, collection: &str) -> Result<()> {
        let Some(declared) = self
            .schema
            .as_ref()
            .and_then(|schema| schema.get_collection(collection))
        else {
            return Ok(());
        };
        if !self.ensured.contains(collection) {
            self.store
                .ensure(collection, PRIMARY_KEY_PATH, &declared.index_defs())
                .await?;
            self.ensured.insert(collection.to_string());
        }
        Ok(())
    }

    /// Run a query. Collections that are neither stored nor declared in the
    /// schema are `CollectionNotFound`.
    pub async fn query(&self, spec: &QuerySpec) -> Result<QueryResult> {
        let plan = self.explain(spec).await?;
        let candidates = match &plan {
            QueryPlan::IndexLookup { index, key } => {
                self.store
                    .get_by_range(&spec.collection, index, &KeyRange::exact(key.clone()))
                    .await?
            }
            QueryPlan::FullScan => self.store.get_all(&spec.collection).await?,
        };

        tracing::debug!(
            collection = %spec.collection,
            plan = ?plan,
            candidates = candidates.len(),
            "Query executed"
        );

        Ok(execute(candidates, spec))
    }
}
