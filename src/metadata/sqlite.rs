//! SQLite-backed metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::store::{FileRecord, FileStatus, MetadataStore};

/// Metadata store backed by a single SQLite database file.
pub struct SqliteMetadataStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables and indexes if they do not already exist.
    /// This is idempotent -- safe to call on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            -- Files keyed by content hash
            CREATE TABLE IF NOT EXISTS files (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hash TEXT NOT NULL UNIQUE,
                filename     TEXT NOT NULL,
                mime_type    TEXT NOT NULL DEFAULT 'application/octet-stream',
                size_bytes   INTEGER NOT NULL DEFAULT 0,
                storage_path TEXT NOT NULL,
                status       TEXT NOT NULL DEFAULT 'uploading',
                total_parts  INTEGER NOT NULL,
                owner_id     TEXT NOT NULL,
                created_at   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_files_owner
                ON files(owner_id);
            CREATE INDEX IF NOT EXISTS idx_files_status
                ON files(status);
            ",
        )?;
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
        let status: String = row.get(6)?;
        Ok(FileRecord {
            id: row.get(0)?,
            content_hash: row.get(1)?,
            filename: row.get(2)?,
            mime_type: row.get(3)?,
            size_bytes: row.get::<_, i64>(4)? as u64,
            storage_path: row.get(5)?,
            status: FileStatus::parse(&status).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    6,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?,
            total_parts: row.get::<_, i64>(7)? as u32,
            owner_id: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn select_file(conn: &Connection, content_hash: &str) -> anyhow::Result<Option<FileRecord>> {
        let record = conn
            .query_row(
                "SELECT id, content_hash, filename, mime_type, size_bytes, storage_path,
                        status, total_parts, owner_id, created_at
                 FROM files WHERE content_hash = ?1",
                params![content_hash],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn get_file(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileRecord>>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            Self::select_file(&conn, &content_hash)
        })
    }

    fn create_uploading(
        &self,
        record: FileRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<FileRecord>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            // INSERT OR IGNORE makes concurrent creates converge on one
            // row; the read-back returns whoever won.
            conn.execute(
                "INSERT OR IGNORE INTO files
                     (content_hash, filename, mime_type, size_bytes, storage_path,
                      status, total_parts, owner_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'uploading', ?6, ?7, ?8)",
                params![
                    record.content_hash,
                    record.filename,
                    record.mime_type,
                    record.size_bytes as i64,
                    record.storage_path,
                    record.total_parts as i64,
                    record.owner_id,
                    record.created_at,
                ],
            )?;
            Self::select_file(&conn, &record.content_hash)?
                .ok_or_else(|| anyhow::anyhow!("File record vanished after insert"))
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
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE files
                 SET status = 'completed', size_bytes = ?2, storage_path = ?3, total_parts = ?4
                 WHERE content_hash = ?1 AND status != 'completed'",
                params![
                    content_hash,
                    size_bytes as i64,
                    storage_path,
                    total_parts as i64
                ],
            )?;
            Ok(())
        })
    }

    fn mark_error(
        &self,
        content_hash: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let content_hash = content_hash.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE files SET status = 'error'
                 WHERE content_hash = ?1 AND status != 'completed'",
                params![content_hash],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: &str) -> FileRecord {
        FileRecord {
            id: 0,
            content_hash: hash.to_string(),
            filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 0,
            storage_path: format!("2024-04-09/7/{hash}.pdf"),
            status: FileStatus::Uploading,
            total_parts: 3,
            owner_id: "7".to_string(),
            created_at: "2024-04-09T12:00:00Z".to_string(),
        }
    }

    fn store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(":memory:").unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store();
        let created = store.create_uploading(record("h1")).await.unwrap();
        assert!(created.id > 0);
        assert_eq!(created.status, FileStatus::Uploading);

        let got = store.get_file("h1").await.unwrap().unwrap();
        assert_eq!(got.id, created.id);
        assert_eq!(got.filename, "report.pdf");
        assert_eq!(got.total_parts, 3);
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = store();
        let first = store.create_uploading(record("h1")).await.unwrap();
        let mut dup = record("h1");
        dup.filename = "other-name.pdf".to_string();
        let second = store.create_uploading(dup).await.unwrap();
        // Second create returns the winner's row unchanged.
        assert_eq!(second.id, first.id);
        assert_eq!(second.filename, "report.pdf");
    }

    #[tokio::test]
    async fn test_complete_sets_final_fields_and_sticks() {
        let store = store();
        store.create_uploading(record("h1")).await.unwrap();
        store
            .upsert_completed("h1", 4096, "https://b.s3.us-east-1.amazonaws.com/k", 3)
            .await
            .unwrap();

        let got = store.get_file("h1").await.unwrap().unwrap();
        assert_eq!(got.status, FileStatus::Completed);
        assert_eq!(got.size_bytes, 4096);
        assert_eq!(got.storage_path, "https://b.s3.us-east-1.amazonaws.com/k");

        // Repeat completion and a later error are both no-ops.
        store
            .upsert_completed("h1", 9999, "elsewhere", 9)
            .await
            .unwrap();
        store.mark_error("h1").await.unwrap();
        let got = store.get_file("h1").await.unwrap().unwrap();
        assert_eq!(got.status, FileStatus::Completed);
        assert_eq!(got.size_bytes, 4096);
        assert_eq!(got.total_parts, 3);
    }

    #[tokio::test]
    async fn test_mark_error() {
        let store = store();
        store.create_uploading(record("h1")).await.unwrap();
        store.mark_error("h1").await.unwrap();
        let got = store.get_file("h1").await.unwrap().unwrap();
        assert_eq!(got.status, FileStatus::Error);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = store();
        assert!(store.get_file("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("files.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteMetadataStore::new(path).unwrap();
            store.create_uploading(record("h1")).await.unwrap();
            store.upsert_completed("h1", 123, "p", 3).await.unwrap();
        }

        let store = SqliteMetadataStore::new(path).unwrap();
        let got = store.get_file("h1").await.unwrap().unwrap();
        assert_eq!(got.status, FileStatus::Completed);
        assert_eq!(got.size_bytes, 123);
    }
}
