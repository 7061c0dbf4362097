//! In-memory session store.
//!
//! Holds session state in a `RwLock<HashMap>` with per-entry expiry
//! stamps. Suitable for tests and single-instance deployments; the
//! atomic primitives all execute under one lock acquisition, so the
//! set-if-absent / append / finalize-gate semantics match the trait
//! contract exactly.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::store::{PartEntry, SessionHandle, SessionPhase, SessionStore};

struct Entry {
    handle: SessionHandle,
    phase: SessionPhase,
    /// Parts keyed by part number; the BTreeMap keeps them ordered and
    /// makes re-appends replace rather than duplicate.
    parts: BTreeMap<u32, PartEntry>,
    touched_at: Instant,
}

/// Session store backed by process memory.
pub struct MemorySessionStore {
    inner: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl MemorySessionStore {
    /// Create a store whose sessions expire `ttl` after their last touch.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        entry.touched_at.elapsed() >= self.ttl
    }

    /// Backdate every entry past its TTL. Test hook for the sweep.
    #[cfg(test)]
    pub fn expire_all(&self) {
        let mut inner = self.inner.write().expect("rwlock poisoned");
        for entry in inner.values_mut() {
            entry.touched_at = Instant::now() - self.ttl - Duration::from_secs(1);
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn get_session(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<SessionHandle>>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner
                .get(&content_hash)
                .filter(|e| !self.is_expired(e))
                .map(|e| e.handle.clone()))
        })
    }

    fn set_session_if_absent(
        &self,
        content_hash: &str,
        handle: SessionHandle,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            match inner.get(&content_hash) {
                Some(existing) if !self.is_expired(existing) => Ok(false),
                _ => {
                    inner.insert(
                        content_hash,
                        Entry {
                            handle,
                            phase: SessionPhase::Uploading,
                            parts: BTreeMap::new(),
                            touched_at: Instant::now(),
                        },
                    );
                    Ok(true)
                }
            }
        })
    }

    fn append_part(
        &self,
        content_hash: &str,
        part: PartEntry,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            let entry = inner
                .get_mut(&content_hash)
                .ok_or_else(|| anyhow::anyhow!("No session for content hash {content_hash}"))?;
            entry.parts.insert(part.part_number, part);
            entry.touched_at = Instant::now();
            Ok(())
        })
    }

    fn list_parts(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<PartEntry>>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner
                .get(&content_hash)
                .filter(|e| !self.is_expired(e))
                .map(|e| e.parts.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn try_begin_finalize(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            match inner.get_mut(&content_hash) {
                Some(entry) if entry.phase == SessionPhase::Uploading => {
                    entry.phase = SessionPhase::Finalizing;
                    entry.touched_at = Instant::now();
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn abort_finalize(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            if let Some(entry) = inner.get_mut(&content_hash) {
                if entry.phase == SessionPhase::Finalizing {
                    entry.phase = SessionPhase::Uploading;
                }
            }
            Ok(())
        })
    }

    fn clear_session(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().expect("rwlock poisoned");
            inner.remove(&content_hash);
            Ok(())
        })
    }

    fn list_stale_sessions(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<(String, SessionHandle)>>> + Send + '_>>
    {
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner
                .iter()
                .filter(|(_, e)| self.is_expired(e))
                .map(|(hash, e)| (hash.clone(), e.handle.clone()))
                .collect())
        })
    }
}
