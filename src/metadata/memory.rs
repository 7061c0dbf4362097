//! In-memory metadata store.
//!
//! Stores all metadata in memory with no persistence. Useful for testing
//! and ephemeral deployments. Uses `RwLock<HashMap>` for thread-safe access.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use super::store::{FileRecord, FileStatus, MetadataStore};

#[derive(Default)]
struct Inner {
    files: HashMap<String, FileRecord>,
    next_id: i64,
}

pub struct MemoryMetadataStore {
    inner: RwLock<Inner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn get_file(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileRecord>>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner.files.get(&content_hash).cloned())
        })
    }

    fn create_uploading(
        &self,
        mut record: FileRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<FileRecord>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            if let Some(existing) = inner.files.get(&record.content_hash) {
                return Ok(existing.clone());
            }
            inner.next_id += 1;
            record.id = inner.next_id;
            record.status = FileStatus::Uploading;
            inner
                .files
                .insert(record.content_hash.clone(), record.clone());
            Ok(record)
        })
    }

    fn upsert_completed(
        &self,
        content_hash: &str,
        size_bytes: u64,
        storage_path: &str,
        total_parts: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        let storage_path = storage_path.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            if let Some(record) = inner.files.get_mut(&content_hash) {
                if record.status != FileStatus::Completed {
                    record.status = FileStatus::Completed;
                    record.size_bytes = size_bytes;
                    record.storage_path = storage_path;
                    record.total_parts = total_parts;
                }
            }
            Ok(())
        })
    }

    fn mark_error(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            if let Some(record) = inner.files.get_mut(&content_hash) {
                if record.status != FileStatus::Completed {
                    record.status = FileStatus::Error;
                }
            }
            Ok(())
        })
    }
}
