//! Conflict resolution between local items and pulled remote items.
//!
//! Resolution looks at `updatedAt` only. The strictly newer side wins; what
//! happens on a tie is a policy decision, defaulting to "remote applied".

use crate::{Item, ItemId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Which side wins when both carry the same `updatedAt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieBreak {
    #[default]
    Remote,
    Local,
}

/// Outcome of comparing a local item with its remote counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Overwrite the local item with the remote one
    TakeRemote,
    /// Discard the remote change
    KeepLocal,
}

/// Pluggable conflict policy.
pub trait ConflictPolicy: Send + Sync {
    fn resolve(&self, local: &Item, remote: &Item) -> Resolution;
}

/// Newer `updatedAt` wins; ties go to [`TieBreak`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWriteWins {
    pub tie: TieBreak,
}

impl LastWriteWins {
    pub fn new(tie: TieBreak) -> Self {
        Self { tie }
    }
}

impl ConflictPolicy for LastWriteWins {
    fn resolve(&self, local: &Item, remote: &Item) -> Resolution {
        match remote.updated_at.cmp(&local.updated_at) {
            Ordering::Greater => Resolution::TakeRemote,
            Ordering::Less => Resolution::KeepLocal,
            Ordering::Equal => match self.tie {
                TieBreak::Remote => Resolution::TakeRemote,
                TieBreak::Local => Resolution::KeepLocal,
            },
        }
    }
}

/// A conflict that was detected and resolved during a pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub item_id: ItemId,
    pub local_updated_at: Timestamp,
    pub remote_updated_at: Timestamp,
    pub resolution: Resolution,
}

/// What to do with one pulled item.
#[derive(Debug, Clone, PartialEq)]
pub enum PullDecision {
    /// No local counterpart: store the remote item.
    Insert(Item),
    /// Remote won: replace the local item.
    Overwrite { item: Item, conflict: Conflict },
    /// Local won: keep it, drop the remote change.
    Discard { conflict: Conflict },
}

/// Decide how a pulled item merges with local state.
///
/// The stored item keeps the remote `updatedAt` and is marked as remote
/// origin.
pub fn decide(local: Option<&Item>, remote: Item, policy: &dyn ConflictPolicy) -> PullDecision {
    let mut remote = remote;
    remote.origin = crate::Origin::Remote;

    let Some(local) = local else {
        return PullDecision::Insert(remote);
    };

    let resolution = policy.resolve(local, &remote);
    let conflict = Conflict {
        item_id: local.id.clone(),
        local_updated_at: local.updated_at,
        remote_updated_at: remote.updated_at,
        resolution,
    };
    match resolution {
        Resolution::TakeRemote => PullDecision::Overwrite {
            item: remote,
            conflict,
        },
        Resolution::KeepLocal => PullDecision::Discard { conflict },
    }
}
