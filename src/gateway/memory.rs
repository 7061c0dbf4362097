//! In-memory object-store gateway.
//!
//! Emulates the multipart protocol in process memory: real session
//! tokens, quoted-MD5 entity tags, and the same complete-time part
//! validation a remote store performs. Used by tests and by local
//! single-node deployments that don't need durability.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

use super::backend::{GatewayError, ObjectGateway};

struct MultipartState {
    object_key: String,
    /// part number -> (size, entity tag)
    parts: HashMap<u32, (usize, String)>,
}

/// Gateway backed by process memory.
pub struct MemoryGateway {
    /// Live multipart sessions keyed by session token.
    uploads: RwLock<HashMap<String, MultipartState>>,
    /// Finished objects keyed by object key, holding total size.
    objects: RwLock<HashMap<String, u64>>,
    completed: AtomicUsize,
    aborted: AtomicUsize,
    /// Parts in {n} remaining before upload_part fails on purpose.
    #[cfg(test)]
    fail_uploads: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            uploads: RwLock::new(HashMap::new()),
            objects: RwLock::new(HashMap::new()),
            completed: AtomicUsize::new(0),
            aborted: AtomicUsize::new(0),
            #[cfg(test)]
            fail_uploads: AtomicUsize::new(0),
        }
    }

    /// Number of multipart sessions still open.
    pub fn live_multipart_count(&self) -> usize {
        self.uploads.read().expect("rwlock poisoned").len()
    }

    /// Number of successful complete_multipart calls.
    pub fn complete_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Number of abort_multipart calls that found a session.
    pub fn aborted_count(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Whether a finished object exists under `object_key`.
    pub fn object_exists(&self, object_key: &str) -> bool {
        self.objects
            .read()
            .expect("rwlock poisoned")
            .contains_key(object_key)
    }

    /// Make the next `n` upload_part calls fail transiently.
    #[cfg(test)]
    pub fn fail_next_uploads(&self, n: usize) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    fn entity_tag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectGateway for MemoryGateway {
    fn begin_multipart(
        &self,
        object_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + '_>> {
        let object_key = object_key.to_string();
        Box::pin(async move {
            let multipart_id = Uuid::new_v4().to_string();
            let mut uploads = self.uploads.write().expect("rwlock poisoned");
            uploads.insert(
                multipart_id.clone(),
                MultipartState {
                    object_key,
                    parts: HashMap::new(),
                },
            );
            Ok(multipart_id)
        })
    }

    fn upload_part(
        &self,
        _object_key: &str,
        multipart_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + '_>> {
        let multipart_id = multipart_id.to_string();
        Box::pin(async move {
            #[cfg(test)]
            {
                // Compare-and-decrement so concurrent parts each burn one
                // scheduled failure.
                loop {
                    let remaining = self.fail_uploads.load(Ordering::SeqCst);
                    if remaining == 0 {
                        break;
                    }
                    if self
                        .fail_uploads
                        .compare_exchange(
                            remaining,
                            remaining - 1,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        return Err(GatewayError::Transient {
                            message: "upload_part: injected failure".to_string(),
                        });
                    }
                }
            }

            if part_number == 0 {
                return Err(GatewayError::Fatal {
                    message: "upload_part: part numbers start at 1".to_string(),
                });
            }

            let tag = Self::entity_tag(&data);
            let mut uploads = self.uploads.write().expect("rwlock poisoned");
            let state = uploads
                .get_mut(&multipart_id)
                .ok_or_else(|| GatewayError::Fatal {
                    message: format!("upload_part: no such multipart session {multipart_id}"),
                })?;
            state.parts.insert(part_number, (data.len(), tag.clone()));
            Ok(tag)
        })
    }

    fn complete_multipart(
        &self,
        object_key: &str,
        multipart_id: &str,
        parts: &[(u32, String)],
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + '_>> {
        let object_key = object_key.to_string();
        let multipart_id = multipart_id.to_string();
        let parts = parts.to_vec();
        Box::pin(async move {
            let mut uploads = self.uploads.write().expect("rwlock poisoned");
            let state = uploads
                .get(&multipart_id)
                .ok_or_else(|| GatewayError::Fatal {
                    message: format!(
                        "complete_multipart: no such multipart session {multipart_id}"
                    ),
                })?;

            if parts.is_empty() {
                return Err(GatewayError::Fatal {
                    message: "complete_multipart: empty part list".to_string(),
                });
            }

            // Same validation S3 performs: 1-based, ascending, no gaps,
            // tags matching the uploaded parts.
            let mut total: u64 = 0;
            for (i, (number, tag)) in parts.iter().enumerate() {
                let expected = (i + 1) as u32;
                if *number != expected {
                    return Err(GatewayError::Fatal {
                        message: format!(
                            "complete_multipart: part {number} out of order, expected {expected}"
                        ),
                    });
                }
                match state.parts.get(number) {
                    Some((size, stored_tag)) if stored_tag == tag => total += *size as u64,
                    Some(_) => {
                        return Err(GatewayError::Fatal {
                            message: format!("complete_multipart: entity tag mismatch on part {number}"),
                        })
                    }
                    None => {
                        return Err(GatewayError::Fatal {
                            message: format!("complete_multipart: part {number} was never uploaded"),
                        })
                    }
                }
            }

            if state.object_key != object_key {
                return Err(GatewayError::Fatal {
                    message: format!(
                        "complete_multipart: session {multipart_id} belongs to a different key"
                    ),
                });
            }

            uploads.remove(&multipart_id);
            drop(uploads);

            self.objects
                .write()
                .expect("rwlock poisoned")
                .insert(object_key, total);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn abort_multipart(
        &self,
        _object_key: &str,
        multipart_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + '_>> {
        let multipart_id = multipart_id.to_string();
        Box::pin(async move {
            let mut uploads = self.uploads.write().expect("rwlock poisoned");
            if uploads.remove(&multipart_id).is_some() {
                self.aborted.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multipart_lifecycle() {
        let gw = MemoryGateway::new();
        let id = gw.begin_multipart("k").await.unwrap();
        assert_eq!(gw.live_multipart_count(), 1);

        let t1 = gw
            .upload_part("k", &id, 1, Bytes::from("hello "))
            .await
            .unwrap();
        let t2 = gw
            .upload_part("k", &id, 2, Bytes::from("world"))
            .await
            .unwrap();
        assert!(t1.starts_with('"') && t1.ends_with('"'));

        gw.complete_multipart("k", &id, &[(1, t1), (2, t2)])
            .await
            .unwrap();
        assert_eq!(gw.live_multipart_count(), 0);
        assert_eq!(gw.complete_count(), 1);
        assert!(gw.object_exists("k"));
    }

    #[tokio::test]
    async fn test_complete_rejects_gap() {
        let gw = MemoryGateway::new();
        let id = gw.begin_multipart("k").await.unwrap();
        let t1 = gw
            .upload_part("k", &id, 1, Bytes::from("a"))
            .await
            .unwrap();
        let t3 = gw
            .upload_part("k", &id, 3, Bytes::from("c"))
            .await
            .unwrap();
        let err = gw
            .complete_multipart("k", &id, &[(1, t1), (3, t3)])
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_complete_rejects_unknown_session() {
        let gw = MemoryGateway::new();
        let err = gw
            .complete_multipart("k", "nope", &[(1, "\"x\"".to_string())])
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_reupload_replaces_part() {
        let gw = MemoryGateway::new();
        let id = gw.begin_multipart("k").await.unwrap();
        let _old = gw
            .upload_part("k", &id, 1, Bytes::from("first"))
            .await
            .unwrap();
        let new = gw
            .upload_part("k", &id, 1, Bytes::from("second"))
            .await
            .unwrap();
        gw.complete_multipart("k", &id, &[(1, new)]).await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let gw = MemoryGateway::new();
        let id = gw.begin_multipart("k").await.unwrap();
        gw.abort_multipart("k", &id).await.unwrap();
        gw.abort_multipart("k", &id).await.unwrap();
        assert_eq!(gw.aborted_count(), 1);
        assert_eq!(gw.live_multipart_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_burn_down() {
        let gw = MemoryGateway::new();
        let id = gw.begin_multipart("k").await.unwrap();
        gw.fail_next_uploads(2);

        let e1 = gw
            .upload_part("k", &id, 1, Bytes::from("x"))
            .await
            .unwrap_err();
        assert!(e1.is_transient());
        let e2 = gw
            .upload_part("k", &id, 1, Bytes::from("x"))
            .await
            .unwrap_err();
        assert!(e2.is_transient());
        // Third attempt succeeds.
        gw.upload_part("k", &id, 1, Bytes::from("x")).await.unwrap();
    }
}
