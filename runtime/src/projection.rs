//! Live query projections.
//!
//! Observers register a query; after every local mutation or applied pull of
//! that collection the hub re-runs the query and hands each observer a fresh
//! [`ProjectionSnapshot`]. Queries run through [`ProjectionHub::query`] are
//! published to observers of the same query. Writes are persisted before
//! anything is published.

use crate::error::Result;
use crate::query::QueryEngine;
use dashmap::DashMap;
use harbor_engine::{ProjectionObserver, ProjectionSnapshot, QueryResult, QuerySpec};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`ProjectionHub::subscribe`].
pub type SubscriptionId = u64;

struct Subscription {
    spec: QuerySpec,
    observer: Arc<dyn ProjectionObserver>,
}

pub struct ProjectionHub {
    queries: QueryEngine,
    subscriptions: DashMap<SubscriptionId, Subscription>,
    next_id: AtomicU64,
}

impl ProjectionHub {
    pub fn new(queries: QueryEngine) -> Self {
        Self {
            queries,
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an observer and deliver its initial snapshot.
    pub async fn subscribe(
        &self,
        spec: QuerySpec,
        observer: Arc<dyn ProjectionObserver>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.snapshot(&spec).await;
        observer.on_snapshot(&snapshot);
        self.subscriptions
            .insert(id, Subscription { spec, observer });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Run `spec` and publish the outcome to every observer registered for
    /// the same query.
    pub async fn query(&self, spec: &QuerySpec) -> Result<QueryResult> {
        let result = self.queries.query(spec).await;
        let snapshot = match &result {
            Ok(result) => ProjectionSnapshot::ready(
                &spec.collection,
                result.items.clone(),
                result.total_count,
            ),
            Err(e) => ProjectionSnapshot::failed(&spec.collection, e.to_string()),
        };

        let observers: Vec<Arc<dyn ProjectionObserver>> = self
            .subscriptions
            .iter()
            .filter(|s| s.spec == *spec)
            .map(|s| Arc::clone(&s.observer))
            .collect();
        for observer in observers {
            observer.on_snapshot(&snapshot);
        }
        result
    }

    /// Re-run every query over `collection` and publish the results.
    pub async fn refresh(&self, collection: &str) {
        let targets: Vec<(QuerySpec, Arc<dyn ProjectionObserver>)> = self
            .subscriptions
            .iter()
            .filter(|s| s.spec.collection == collection)
            .map(|s| (s.spec.clone(), Arc::clone(&s.observer)))
            .collect();

        for (spec, observer) in targets {
            let snapshot = self.snapshot(&spec).await;
            observer.on_snapshot(&snapshot);
        }
    }

    async fn snapshot(&self, spec: &QuerySpec) -> ProjectionSnapshot {
        match self.queries.query(spec).await {
            Ok(result) => {
                ProjectionSnapshot::ready(&spec.collection, result.items, result.total_count)
            }
            Err(e) => {
                tracing::warn!(collection = %spec.collection, error = %e, "Projection query failed");
                ProjectionSnapshot::failed(&spec.collection, e.to_string())
            }
        }
    }
}
