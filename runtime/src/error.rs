//! Unified error handling for the runtime.

use crate::config::ConfigError;
use harbor_engine::ErrorKind;

/// Runtime error type.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Engine error: {0}")]
    Engine(#[from] harbor_engine::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Attachment error: {0}")]
    Attachment(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RuntimeError {
    /// Classify for callers that only care about retryability and surface.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Engine(e) => e.kind(),
            RuntimeError::Database(_)
            | RuntimeError::Migration(_)
            | RuntimeError::Serialization(_)
            | RuntimeError::Corrupt(_) => ErrorKind::StorageFailure,
            RuntimeError::Remote(_) => ErrorKind::RemoteFailure,
            RuntimeError::Attachment(_) => ErrorKind::AttachmentFailure,
            RuntimeError::Config(_) => ErrorKind::Validation,
        }
    }
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, RuntimeError>;
