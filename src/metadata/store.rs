//! Abstract metadata store trait.
//!
//! Any metadata backend must implement [`MetadataStore`].  The trait
//! uses `async_trait`-style methods (manual desugaring with pinned
//! futures) so it can be used with both SQLite and future remote stores.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

// -- File records ------------------------------------------------------------

/// Lifecycle state of a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Chunks are still arriving.
    Uploading,
    /// The object was assembled and the record is final.
    Completed,
    /// Finalization hit a fatal error; the record stays for diagnosis.
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Uploading => "uploading",
            FileStatus::Completed => "completed",
            FileStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "uploading" => Ok(FileStatus::Uploading),
            "completed" => Ok(FileStatus::Completed),
            "error" => Ok(FileStatus::Error),
            other => anyhow::bail!("Unknown file status: {other}"),
        }
    }
}

/// A stored file, keyed by content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Row ID assigned by the store.
    pub id: i64,
    /// Client-computed hash of the whole file.
    pub content_hash: String,
    /// Original filename as submitted.
    pub filename: String,
    /// MIME type derived from the filename extension.
    pub mime_type: String,
    /// Total size in bytes; 0 until completion when unknown.
    pub size_bytes: u64,
    /// Object key within the backing store.
    pub storage_path: String,
    /// Lifecycle state.
    pub status: FileStatus,
    /// Declared number of chunks.
    pub total_parts: u32,
    /// Owner identity string.
    pub owner_id: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

// -- Store trait -------------------------------------------------------------

/// Async metadata persistence contract.
///
/// All mutating operations are idempotent so the coordinator can call
/// them again after a partial failure without corrupting state.
pub trait MetadataStore: Send + Sync + 'static {
    /// Look up a file by content hash.
    fn get_file(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileRecord>>> + Send + '_>>;

    /// Create a record in the `uploading` state, or return the existing
    /// record unchanged if one is already present for this hash.
    fn create_uploading(
        &self,
        record: FileRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<FileRecord>> + Send + '_>>;

    /// Move the record for `content_hash` to `completed`, setting the
    /// final size, storage path, and part total. A record already
    /// completed is left alone; the status never moves backward.
    fn upsert_completed(
        &self,
        content_hash: &str,
        size_bytes: u64,
        storage_path: &str,
        total_parts: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Move the record for `content_hash` to `error` unless it already
    /// completed.
    fn mark_error(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}
