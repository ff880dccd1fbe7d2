//! # Snapshot Repository
//!
//! Persistent last-known state of the remote store, keyed by remote id.
//!
//! ## Overview
//!
//! All scan writes go through a [`SnapshotTransaction`]: the scanner reads the
//! records it needs, applies deletions and upserts, then commits once. A
//! transaction dropped without commit is rolled back, so a cancelled or failed
//! scan leaves the snapshot untouched.
//!
//! Both `path` and `remote_id` are unique. Upserting a record whose path is
//! held by a different id evicts the older holder first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::models::FileRecord;

/// Keeps `IN (...)` lists well below SQLite's bound-parameter limit.
const CHUNK_SIZE: usize = 500;

const RECORD_COLUMNS: &str =
    "path, remote_id, modified_time, size, is_directory, mime_type, last_checked";

// ============================================================================
// Repository Traits
// ============================================================================

/// Snapshot persistence
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Open a unit of work. Nothing it writes is visible until commit.
    async fn begin(&self) -> Result<Box<dyn SnapshotTransaction>>;

    async fn find_by_path(&self, path: &str) -> Result<Option<FileRecord>>;

    /// Every non-directory record, ordered by path.
    async fn list_files(&self) -> Result<Vec<FileRecord>>;

    async fn count(&self) -> Result<u64>;
}

/// A single atomic unit of snapshot work.
#[async_trait]
pub trait SnapshotTransaction: Send {
    /// Records whose remote id is in `ids`. Unknown ids are ignored.
    async fn get_by_ids(&mut self, ids: &[String]) -> Result<Vec<FileRecord>>;

    /// Records at or beneath normalized `root`. The empty root is everything.
    async fn list_under(&mut self, root: &str) -> Result<Vec<FileRecord>>;

    /// Insert or update by remote id.
    async fn upsert(&mut self, records: &[FileRecord]) -> Result<()>;

    /// Returns the number of records removed.
    async fn delete_by_ids(&mut self, ids: &[String]) -> Result<u64>;

    /// Remove records not observed since `cutoff`.
    async fn delete_older_than(&mut self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of SnapshotStore
#[derive(Clone)]
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the snapshot table and indexes if they do not exist.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                remote_id TEXT NOT NULL UNIQUE,
                modified_time INTEGER NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                is_directory INTEGER NOT NULL DEFAULT 0,
                mime_type TEXT,
                last_checked INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_file_records_last_checked ON file_records(last_checked)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }
}

impl std::fmt::Debug for SqliteSnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSnapshotStore").finish_non_exhaustive()
    }
}

/// Database row representation of a snapshot record
#[derive(Debug, FromRow)]
struct FileRecordRow {
    path: String,
    remote_id: String,
    modified_time: i64,
    size: i64,
    is_directory: bool,
    mime_type: Option<String>,
    last_checked: i64,
}

impl TryFrom<FileRecordRow> for FileRecord {
    type Error = SyncError;

    fn try_from(row: FileRecordRow) -> Result<Self> {
        let timestamp = |millis: i64, column: &str| {
            DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
                SyncError::InvalidRecord(format!("{} out of range for {}", column, row.path))
            })
        };

        Ok(FileRecord {
            modified_time: timestamp(row.modified_time, "modified_time")?,
            last_checked: timestamp(row.last_checked, "last_checked")?,
            size: u64::try_from(row.size).map_err(|_| {
                SyncError::InvalidRecord(format!("negative size for {}", row.path))
            })?,
            is_directory: row.is_directory,
            mime_type: row.mime_type,
            remote_id: row.remote_id,
            path: row.path,
        })
    }
}

fn into_records(rows: Vec<FileRecordRow>) -> Result<Vec<FileRecord>> {
    rows.into_iter().map(FileRecord::try_from).collect()
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn begin(&self) -> Result<Box<dyn SnapshotTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;
        Ok(Box::new(SqliteSnapshotTransaction { tx }))
    }

    async fn find_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRecordRow>(&format!(
            "SELECT {} FROM file_records WHERE path = ?",
            RECORD_COLUMNS
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(FileRecord::try_from).transpose()
    }

    async fn list_files(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecordRow>(&format!(
            "SELECT {} FROM file_records WHERE is_directory = 0 ORDER BY path",
            RECORD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        into_records(rows)
    }

    async fn count(&self) -> Result<u64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM file_records")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(count.0.max(0) as u64)
    }
}

/// Open SQLite transaction. Rolls back on drop unless committed.
pub struct SqliteSnapshotTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl SnapshotTransaction for SqliteSnapshotTransaction {
    async fn get_by_ids(&mut self, ids: &[String]) -> Result<Vec<FileRecord>> {
        let mut records = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(CHUNK_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "SELECT {} FROM file_records WHERE remote_id IN (",
                RECORD_COLUMNS
            ));
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");

            let rows = builder
                .build_query_as::<FileRecordRow>()
                .fetch_all(&mut *self.tx)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?;
            records.extend(into_records(rows)?);
        }

        Ok(records)
    }

    async fn list_under(&mut self, root: &str) -> Result<Vec<FileRecord>> {
        let result = if root.is_empty() {
            sqlx::query_as::<_, FileRecordRow>(&format!(
                "SELECT {} FROM file_records",
                RECORD_COLUMNS
            ))
            .fetch_all(&mut *self.tx)
            .await
        } else {
            // substr avoids LIKE wildcard escaping for names containing % or _
            let prefix = format!("{}/", root);
            sqlx::query_as::<_, FileRecordRow>(&format!(
                "SELECT {} FROM file_records WHERE path = ? OR substr(path, 1, length(?)) = ?",
                RECORD_COLUMNS
            ))
            .bind(root)
            .bind(&prefix)
            .bind(&prefix)
            .fetch_all(&mut *self.tx)
            .await
        };
        let rows = result.map_err(|e| SyncError::Database(e.to_string()))?;

        into_records(rows)
    }

    async fn upsert(&mut self, records: &[FileRecord]) -> Result<()> {
        for record in records {
            // A different id may still hold this path after a rename
            let evicted = sqlx::query("DELETE FROM file_records WHERE path = ? AND remote_id <> ?")
                .bind(&record.path)
                .bind(&record.remote_id)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?
                .rows_affected();
            if evicted > 0 {
                debug!(path = %record.path, "Evicted stale record holding path");
            }

            sqlx::query(
                r#"
                INSERT INTO file_records (
                    path, remote_id, modified_time, size, is_directory, mime_type, last_checked
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(remote_id) DO UPDATE SET
                    path = excluded.path,
                    modified_time = excluded.modified_time,
                    size = excluded.size,
                    is_directory = excluded.is_directory,
                    mime_type = excluded.mime_type,
                    last_checked = excluded.last_checked
                "#,
            )
            .bind(&record.path)
            .bind(&record.remote_id)
            .bind(record.modified_time.timestamp_millis())
            .bind(i64::try_from(record.size).unwrap_or(i64::MAX))
            .bind(record.is_directory)
            .bind(&record.mime_type)
            .bind(record.last_checked.timestamp_millis())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;
        }

        Ok(())
    }

    async fn delete_by_ids(&mut self, ids: &[String]) -> Result<u64> {
        let mut removed = 0;

        for chunk in ids.chunks(CHUNK_SIZE) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM file_records WHERE remote_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");

            removed += builder
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?
                .rows_affected();
        }

        Ok(removed)
    }

    async fn delete_older_than(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM file_records WHERE last_checked < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use chrono::{Duration, TimeZone};

    async fn store() -> SqliteSnapshotStore {
        let store = SqliteSnapshotStore::new(create_test_pool().await.unwrap());
        store.initialize().await.unwrap();
        store
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap()
    }

    fn record(id: &str, path: &str, minute: u32) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            remote_id: id.to_string(),
            modified_time: at(minute),
            size: 1024,
            is_directory: false,
            mime_type: Some("video/x-matroska".to_string()),
            last_checked: at(minute),
        }
    }

    async fn seed(store: &SqliteSnapshotStore, records: &[FileRecord]) {
        let mut tx = store.begin().await.unwrap();
        tx.upsert(records).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = store().await;
        store.initialize().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_and_get_by_ids() {
        let store = store().await;
        seed(&store, &[record("a", "movies/a.mkv", 0), record("b", "movies/b.mkv", 1)]).await;

        let mut tx = store.begin().await.unwrap();
        let found = tx
            .get_by_ids(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(found, vec![record("a", "movies/a.mkv", 0)]);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_updates_by_remote_id() {
        let store = store().await;
        seed(&store, &[record("a", "movies/a.mkv", 0)]).await;
        seed(&store, &[record("a", "movies/renamed.mkv", 5)]).await;

        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.find_by_path("movies/a.mkv").await.unwrap().is_none());
        let moved = store.find_by_path("movies/renamed.mkv").await.unwrap().unwrap();
        assert_eq!(moved.modified_time, at(5));
    }

    #[tokio::test]
    async fn test_upsert_evicts_previous_path_holder() {
        let store = store().await;
        seed(&store, &[record("old", "movies/a.mkv", 0)]).await;
        seed(&store, &[record("new", "movies/a.mkv", 1)]).await;

        assert_eq!(store.count().await.unwrap(), 1);
        let holder = store.find_by_path("movies/a.mkv").await.unwrap().unwrap();
        assert_eq!(holder.remote_id, "new");
    }

    #[tokio::test]
    async fn test_list_under_respects_component_boundaries() {
        let store = store().await;
        seed(
            &store,
            &[
                record("a", "movies", 0),
                record("b", "movies/a.mkv", 0),
                record("c", "movies_old/b.mkv", 0),
                record("d", "tv/c.mkv", 0),
            ],
        )
        .await;

        let mut tx = store.begin().await.unwrap();
        let mut under: Vec<String> = tx
            .list_under("movies")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        under.sort();
        assert_eq!(under, vec!["movies", "movies/a.mkv"]);
        assert_eq!(tx.list_under("").await.unwrap().len(), 4);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = store().await;
        seed(&store, &[record("a", "movies/a.mkv", 0)]).await;

        let mut tx = store.begin().await.unwrap();
        tx.upsert(&[record("b", "movies/b.mkv", 0)]).await.unwrap();
        assert_eq!(tx.delete_by_ids(&["a".to_string()]).await.unwrap(), 1);
        tx.rollback().await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.find_by_path("movies/a.mkv").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = store().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.upsert(&[record("a", "movies/a.mkv", 0)]).await.unwrap();
        }
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let store = store().await;
        seed(&store, &[record("a", "a.mkv", 0), record("b", "b.mkv", 30)]).await;

        let mut tx = store.begin().await.unwrap();
        let removed = tx.delete_older_than(at(0) + Duration::minutes(10)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(removed, 1);
        assert!(store.find_by_path("b.mkv").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_files_skips_directories() {
        let store = store().await;
        let mut dir = record("d", "movies", 0);
        dir.is_directory = true;
        seed(&store, &[record("b", "movies/b.mkv", 0), dir, record("a", "movies/a.mkv", 0)]).await;

        let files: Vec<String> = store
            .list_files()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(files, vec!["movies/a.mkv", "movies/b.mkv"]);
    }

    #[tokio::test]
    async fn test_large_id_sets_are_chunked() {
        let store = store().await;
        let records: Vec<FileRecord> = (0..1200)
            .map(|i| record(&format!("id-{}", i), &format!("bulk/{}.mkv", i), 0))
            .collect();
        seed(&store, &records).await;

        let ids: Vec<String> = records.iter().map(|r| r.remote_id.clone()).collect();
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get_by_ids(&ids).await.unwrap().len(), 1200);
        assert_eq!(tx.delete_by_ids(&ids).await.unwrap(), 1200);
        tx.commit().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
