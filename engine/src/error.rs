//! Error types for the Harbor engine.

use crate::{CollectionName, ItemId};
use thiserror::Error;

/// Coarse classification used by callers to decide whether an error is
/// retryable and how it should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Validation,
    StorageFailure,
    RemoteFailure,
    AttachmentFailure,
}

impl ErrorKind {
    /// Only remote and attachment failures are worth retrying; everything
    /// else is a caller error or a deterministic storage refusal.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RemoteFailure | ErrorKind::AttachmentFailure)
    }
}

/// All possible errors from the Harbor engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Lookup errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("item not found: {collection}/{id}")]
    ItemNotFound {
        collection: CollectionName,
        id: ItemId,
    },

    #[error("index '{index}' is not declared on collection '{collection}'")]
    IndexNotFound {
        collection: CollectionName,
        index: String,
    },

    // Lifecycle errors
    #[error("invalid state for {id}: {reason}")]
    InvalidState { id: ItemId, reason: String },

    // Validation errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid key path: {0}")]
    InvalidKeyPath(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    // Storage errors
    #[error("unique index '{index}' violated by key {key}")]
    UniqueViolation { index: String, key: String },

    #[error("schema upgrade failed for '{collection}': {reason}")]
    SchemaUpgrade {
        collection: CollectionName,
        reason: String,
    },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("storage failure: {0}")]
    Storage(String),

    // Collaborator errors
    #[error("remote failure: {0}")]
    Remote(String),

    #[error("attachment failure: {0}")]
    Attachment(String),
}

impl Error {
    pub fn not_found(collection: impl Into<CollectionName>, id: impl Into<ItemId>) -> Self {
        Error::ItemNotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn invalid_state(id: impl Into<ItemId>, reason: impl Into<String>) -> Self {
        Error::InvalidState {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Map this error onto the taxonomy shared with the runtime.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CollectionNotFound(_) | Error::ItemNotFound { .. } => ErrorKind::NotFound,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::InvalidPayload(_)
            | Error::MissingRequiredField(_)
            | Error::TypeMismatch { .. }
            | Error::InvalidKeyPath(_)
            | Error::InvalidQuery(_)
            | Error::IndexNotFound { .. } => ErrorKind::Validation,
            Error::UniqueViolation { .. }
            | Error::SchemaUpgrade { .. }
            | Error::InvalidSnapshot(_)
            | Error::Storage(_) => ErrorKind::StorageFailure,
            Error::Remote(_) => ErrorKind::RemoteFailure,
            Error::Attachment(_) => ErrorKind::AttachmentFailure,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
