//! Projection snapshots: what a UI layer observes about a collection.

use crate::{CollectionName, Item};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Error,
}

/// The state pushed to observers after a mutation or query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionSnapshot {
    pub collection: CollectionName,
    pub items: Vec<Item>,
    pub total_count: usize,
    pub status: ProjectionStatus,
    pub last_error: Option<String>,
}

impl ProjectionSnapshot {
    pub fn ready(collection: impl Into<CollectionName>, items: Vec<Item>, total_count: usize) -> Self {
        Self {
            collection: collection.into(),
            items,
            total_count,
            status: ProjectionStatus::Ready,
            last_error: None,
        }
    }

    pub fn failed(collection: impl Into<CollectionName>, error: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            status: ProjectionStatus::Error,
            last_error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Receives projection snapshots. Implementations must not block.
pub trait ProjectionObserver: Send + Sync {
    fn on_snapshot(&self, snapshot: &ProjectionSnapshot);
}
