//! Abstract ephemeral session store trait.
//!
//! Any session backend must implement [`SessionStore`].  The trait uses
//! manual desugaring with pinned futures (same shape as the metadata
//! store) so it can sit behind an `Arc<dyn SessionStore>`.
//!
//! The coordinator's correctness rests entirely on three atomic
//! primitives here: `set_session_if_absent` (single writer establishes
//! the multipart session), `append_part` (idempotent per part number),
//! and `try_begin_finalize` (single writer runs finalize).  No caller
//! may substitute process-local state for these; that breaks the
//! moment the service runs more than one instance.

use std::future::Future;
use std::pin::Pin;

/// Immutable identity of an upload session, established once per
/// content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Opaque multipart session token issued by the object store.
    pub multipart_id: String,
    /// The storage-backend key chosen for this file.
    pub object_key: String,
    /// Total number of parts the client declared on the first chunk.
    pub total_parts: u32,
    /// Original filename (drives the MIME type at finalize).
    pub filename: String,
    /// Owner the file belongs to.
    pub owner_id: String,
}

/// One accepted chunk, recorded against its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartEntry {
    /// Part number (1-based, object-store convention).
    pub part_number: u32,
    /// Opaque integrity token the object store returned for the part.
    pub entity_tag: String,
    /// Size of the part in bytes.
    pub size_bytes: u64,
}

/// Lifecycle phase of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Parts are still arriving.
    Uploading,
    /// A worker won the finalize gate and is assembling the object.
    Finalizing,
}

impl SessionPhase {
    /// Stable string form used by persistent backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Uploading => "uploading",
            SessionPhase::Finalizing => "finalizing",
        }
    }
}

/// Async ephemeral session store contract.
pub trait SessionStore: Send + Sync + 'static {
    /// Look up the session for a content hash, if one is live.
    fn get_session(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<SessionHandle>>> + Send + '_>>;

    /// Establish the session for a content hash if none exists.
    ///
    /// Returns `true` if this call created the session (the caller is
    /// the winner), `false` if a session already existed; in that case
    /// the caller must re-read and adopt the winner's values instead of
    /// trusting its own.
    fn set_session_if_absent(
        &self,
        content_hash: &str,
        handle: SessionHandle,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Record an uploaded part. Idempotent: re-appending a part number
    /// replaces the entity tag, never creates a duplicate entry.
    fn append_part(
        &self,
        content_hash: &str,
        part: PartEntry,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// List recorded parts, ordered ascending by part number.
    fn list_parts(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<PartEntry>>> + Send + '_>>;

    /// Atomically transition the session from uploading to finalizing.
    ///
    /// Returns `true` if this call won the transition. Exactly one
    /// concurrent caller wins; everyone else must return without
    /// finalizing.
    fn try_begin_finalize(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>>;

    /// Release the finalize gate after a failed finalize so a later
    /// trigger can retry. No-op if the session is not finalizing.
    fn abort_finalize(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Delete all ephemeral state for a content hash.
    fn clear_session(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// List sessions whose TTL has lapsed, for the reconciliation
    /// sweep. Expired sessions are invisible to `get_session` but stay
    /// listed here until cleared.
    fn list_stale_sessions(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<(String, SessionHandle)>>> + Send + '_>>;
}
