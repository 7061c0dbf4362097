//! SQLite-backed session store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.
//!
//! A shared SQLite file gives multiple service processes the same
//! atomic set-if-absent / finalize-gate semantics the in-memory store
//! provides within one process: the winner is whoever's INSERT OR
//! IGNORE or conditional UPDATE touches a row.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::store::{PartEntry, SessionHandle, SessionPhase, SessionStore};

/// Session store backed by a single SQLite database file.
pub struct SqliteSessionStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
    /// Seconds a session may sit untouched before it is stale.
    ttl_seconds: i64,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str, ttl_seconds: u64) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            ttl_seconds: ttl_seconds as i64,
        };
        store.init_db()?;
        Ok(store)
    }

    /// Create the required tables if they do not already exist.
    /// Idempotent -- safe to call on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;

            -- In-flight upload sessions, keyed by content hash.
            CREATE TABLE IF NOT EXISTS sessions (
                content_hash  TEXT PRIMARY KEY,
                multipart_id  TEXT NOT NULL,
                object_key    TEXT NOT NULL,
                total_parts   INTEGER NOT NULL,
                filename      TEXT NOT NULL,
                owner_id      TEXT NOT NULL,
                phase         TEXT NOT NULL DEFAULT 'uploading',
                touched_at    INTEGER NOT NULL
            );

            -- Accepted parts, one row per (hash, part number).
            CREATE TABLE IF NOT EXISTS session_parts (
                content_hash  TEXT NOT NULL,
                part_number   INTEGER NOT NULL,
                entity_tag    TEXT NOT NULL,
                size_bytes    INTEGER NOT NULL,

                PRIMARY KEY (content_hash, part_number),
                FOREIGN KEY (content_hash) REFERENCES sessions(content_hash) ON DELETE CASCADE
            );
            ",
        )?;
        Ok(())
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Backdate every session past its TTL. Test hook for the sweep.
    #[cfg(test)]
    pub fn expire_all(&self) {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE sessions SET touched_at = touched_at - ?1 - 1",
            params![self.ttl_seconds],
        )
        .expect("expire_all");
    }
}

impl SessionStore for SqliteSessionStore {
    fn get_session(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<SessionHandle>>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let cutoff = Self::now() - self.ttl_seconds;
            let handle = conn
                .query_row(
                    "SELECT multipart_id, object_key, total_parts, filename, owner_id
                     FROM sessions WHERE content_hash = ?1 AND touched_at > ?2",
                    params![content_hash, cutoff],
                    |row| {
                        Ok(SessionHandle {
                            multipart_id: row.get(0)?,
                            object_key: row.get(1)?,
                            total_parts: row.get(2)?,
                            filename: row.get(3)?,
                            owner_id: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(handle)
        })
    }

    fn set_session_if_absent(
        &self,
        content_hash: &str,
        handle: SessionHandle,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;
            // An expired row must not hold the primary key hostage: drop
            // it (parts cascade) so the new session can take its place,
            // just as the in-memory store replaces lapsed entries.
            let cutoff = Self::now() - self.ttl_seconds;
            tx.execute(
                "DELETE FROM sessions WHERE content_hash = ?1 AND touched_at <= ?2",
                params![content_hash, cutoff],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO sessions
                     (content_hash, multipart_id, object_key, total_parts,
                      filename, owner_id, phase, touched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    content_hash,
                    handle.multipart_id,
                    handle.object_key,
                    handle.total_parts,
                    handle.filename,
                    handle.owner_id,
                    SessionPhase::Uploading.as_str(),
                    Self::now(),
                ],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
    }

    fn append_part(
        &self,
        content_hash: &str,
        part: PartEntry,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO session_parts (content_hash, part_number, entity_tag, size_bytes)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(content_hash, part_number)
                 DO UPDATE SET entity_tag = excluded.entity_tag,
                               size_bytes = excluded.size_bytes",
                params![content_hash, part.part_number, part.entity_tag, part.size_bytes],
            )?;
            tx.execute(
                "UPDATE sessions SET touched_at = ?1 WHERE content_hash = ?2",
                params![Self::now(), content_hash],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn list_parts(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<PartEntry>>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT part_number, entity_tag, size_bytes
                 FROM session_parts WHERE content_hash = ?1
                 ORDER BY part_number ASC",
            )?;
            let parts = stmt
                .query_map(params![content_hash], |row| {
                    Ok(PartEntry {
                        part_number: row.get(0)?,
                        entity_tag: row.get(1)?,
                        size_bytes: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(parts)
        })
    }

    fn try_begin_finalize(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let updated = conn.execute(
                "UPDATE sessions SET phase = 'finalizing', touched_at = ?1
                 WHERE content_hash = ?2 AND phase = 'uploading'",
                params![Self::now(), content_hash],
            )?;
            Ok(updated == 1)
        })
    }

    fn abort_finalize(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE sessions SET phase = 'uploading'
                 WHERE content_hash = ?1 AND phase = 'finalizing'",
                params![content_hash],
            )?;
            Ok(())
        })
    }

    fn clear_session(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM session_parts WHERE content_hash = ?1",
                params![content_hash],
            )?;
            tx.execute(
                "DELETE FROM sessions WHERE content_hash = ?1",
                params![content_hash],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn list_stale_sessions(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<(String, SessionHandle)>>> + Send + '_>>
    {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let cutoff = Self::now() - self.ttl_seconds;
            let mut stmt = conn.prepare(
                "SELECT content_hash, multipart_id, object_key, total_parts, filename, owner_id
                 FROM sessions WHERE touched_at <= ?1",
            )?;
            let stale = stmt
                .query_map(params![cutoff], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        SessionHandle {
                            multipart_id: row.get(1)?,
                            object_key: row.get(2)?,
                            total_parts: row.get(3)?,
                            filename: row.get(4)?,
                            owner_id: row.get(5)?,
                        },
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(stale)
        })
    }
}
