//! Abstract object-store gateway trait.
//!
//! Every gateway must implement [`ObjectGateway`].  The trait speaks the
//! multipart protocol only (begin, upload-part, complete, abort) and
//! classifies every failure as transient or fatal so the coordinator
//! knows what is retryable.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Object-store failure, split along the retryable axis.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network trouble, throttling, or a 5xx from the backend. The same
    /// call may succeed if repeated.
    #[error("transient object-store failure: {message}")]
    Transient { message: String },

    /// Invalid credentials, unknown key or upload session. Repeating
    /// the call cannot help.
    #[error("fatal object-store failure: {message}")]
    Fatal { message: String },
}

impl GatewayError {
    /// Whether the failed call may be retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient { .. })
    }
}

/// Async multipart-upload contract against the remote object store.
pub trait ObjectGateway: Send + Sync + 'static {
    /// Open a multipart session for `object_key`, returning the opaque
    /// session token. Callers must not begin twice for the same key
    /// without reconciling through the session store first.
    fn begin_multipart(
        &self,
        object_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + '_>>;

    /// Upload one part, returning its entity tag. Not retried
    /// internally; the coordinator owns the retry policy.
    fn upload_part(
        &self,
        object_key: &str,
        multipart_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + '_>>;

    /// Assemble the uploaded parts into the final object.
    ///
    /// `parts` must be `(part_number, entity_tag)` pairs sorted
    /// ascending by part number with no gaps; the backend rejects
    /// anything else. Safe to retry with the same session token and an
    /// identical part list.
    fn complete_multipart(
        &self,
        object_key: &str,
        multipart_id: &str,
        parts: &[(u32, String)],
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + '_>>;

    /// Discard a multipart session and any parts it holds. Best-effort
    /// cleanup: callers log errors and move on.
    fn abort_multipart(
        &self,
        object_key: &str,
        multipart_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + '_>>;
}
