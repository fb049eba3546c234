//! Attachment store: local blobs referenced from file-typed fields.

use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// A file handed to a create/update call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInput {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl FileInput {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

/// What the attachment store reports back for a stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub file_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn add_file(&self, input: FileInput) -> Result<StoredFile>;

    async fn get_file_data(&self, file_id: &str) -> Result<Vec<u8>>;

    async fn delete_file(&self, file_id: &str) -> Result<()>;

    async fn has_file(&self, file_id: &str) -> bool {
        self.get_file_data(file_id).await.is_ok()
    }
}

/// Attachment store keeping blobs in memory.
#[derive(Debug, Default)]
pub struct MemoryAttachmentStore {
    files: DashMap<String, (StoredFile, Vec<u8>)>,
    fail_writes: AtomicBool,
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `add_file` fail, e.g. to simulate a full disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn add_file(&self, input: FileInput) -> Result<StoredFile> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RuntimeError::Attachment(format!(
                "cannot store {}: writes disabled",
                input.name
            )));
        }
        let stored = StoredFile {
            file_id: uuid::Uuid::new_v4().to_string(),
            name: input.name,
            mime_type: input.mime_type,
            size: input.bytes.len() as u64,
        };
        self.files
            .insert(stored.file_id.clone(), (stored.clone(), input.bytes));
        Ok(stored)
    }

    async fn get_file_data(&self, file_id: &str) -> Result<Vec<u8>> {
        self.files
            .get(file_id)
            .map(|entry| entry.value().1.clone())
            .ok_or_else(|| RuntimeError::Attachment(format!("file {file_id} not found")))
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.files.remove(file_id);
        Ok(())
    }

    async fn has_file(&self, file_id: &str) -> bool {
        self.files.contains_key(file_id)
    }
}
