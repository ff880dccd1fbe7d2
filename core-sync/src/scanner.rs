//! # Change Scanner
//!
//! Diffs a remote listing against the snapshot and emits the differences as
//! [`ChangeEvent`]s.
//!
//! ## Workflow
//!
//! 1. List everything under the scan root
//! 2. Normalize paths, drop duplicate ids and paths (first occurrence wins)
//! 3. Inside one snapshot transaction:
//!    - look up the listed ids
//!    - classify each entry as added, modified (strictly newer mtime) or
//!      unchanged; a path change is reported as delete old + add new
//!    - every snapshot record under the root that was not listed is deleted
//!    - apply deletions, then upserts, then commit
//!
//! A failure anywhere in step 3 rolls the transaction back and no events are
//! returned. Scans are serialized so the snapshot only ever has one writer.

use bridge_traits::remote::{RemoteEntry, RemoteLister};
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::models::{
    is_under_root, normalize_path, ChangeCounts, ChangeEvent, FileRecord,
};
use crate::repository::{SnapshotStore, SnapshotTransaction};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerStats {
    pub total_scans: u64,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_scan_duration_ms: u64,
    /// Change counts of the most recent scan
    pub last_changes: ChangeCounts,
    pub records_swept: u64,
}

pub struct Scanner {
    lister: Arc<dyn RemoteLister>,
    store: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    scan_lock: Mutex<()>,
    stats: Mutex<ScannerStats>,
}

impl Scanner {
    pub fn new(
        lister: Arc<dyn RemoteLister>,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lister,
            store,
            clock,
            scan_lock: Mutex::new(()),
            stats: Mutex::new(ScannerStats::default()),
        }
    }

    async fn lock_and_list(
        &self,
        root: &str,
    ) -> Result<(MutexGuard<'_, ()>, Vec<RemoteEntry>)> {
        let guard = self.scan_lock.lock().await;
        let listing = self.lister.list(root).await?;
        Ok((guard, listing))
    }

    pub async fn stats(&self) -> ScannerStats {
        self.stats.lock().await.clone()
    }

    /// Compare the remote tree under `root` with the snapshot.
    ///
    /// Returns deletions sorted by path after all additions and modifications,
    /// which keep listing order. Renames contribute a deletion of the old path
    /// immediately followed by an addition of the new one.
    ///
    /// # Errors
    ///
    /// Listing failures and snapshot failures are returned unchanged; the
    /// snapshot is not modified in either case.
    #[instrument(skip(self), fields(root = %root))]
    pub async fn scan(&self, root: &str) -> Result<Vec<ChangeEvent>> {
        self.scan_inner(root, None).await
    }

    /// Like [`Scanner::scan`], but gives up with [`SyncError::Cancelled`] if
    /// `token` fires while waiting for another scan or for the listing.
    ///
    /// Once the listing has arrived the diff always runs to completion, so a
    /// committed snapshot is never separated from the events it produced.
    #[instrument(skip(self, token), fields(root = %root))]
    pub async fn scan_until_cancelled(
        &self,
        root: &str,
        token: &CancellationToken,
    ) -> Result<Vec<ChangeEvent>> {
        self.scan_inner(root, Some(token)).await
    }

    async fn scan_inner(
        &self,
        root: &str,
        token: Option<&CancellationToken>,
    ) -> Result<Vec<ChangeEvent>> {
        let started = Instant::now();
        let root = normalize_path(root);
        let (_guard, listing) = match token {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SyncError::Cancelled),
                listed = self.lock_and_list(&root) => listed?,
            },
            None => self.lock_and_list(&root).await?,
        };
        let listed = listing.len();
        let now = self.clock.now();

        let mut seen_ids = HashSet::new();
        let mut seen_paths = HashSet::new();
        let mut observed = Vec::with_capacity(listed);
        for entry in listing {
            let path = normalize_path(&entry.path);
            if path.is_empty() || !is_under_root(&path, &root) {
                warn!(path = %entry.path, "Ignoring entry outside scan root");
                continue;
            }
            if !seen_ids.insert(entry.id.clone()) {
                warn!(remote_id = %entry.id, path = %path, "Duplicate remote id in listing, keeping first");
                continue;
            }
            if !seen_paths.insert(path.clone()) {
                warn!(remote_id = %entry.id, path = %path, "Duplicate path in listing, keeping first");
                continue;
            }
            observed.push(FileRecord::from_entry(&entry, path, now));
        }

        let mut tx = self.store.begin().await?;
        let events = match diff_and_apply(tx.as_mut(), &root, observed).await {
            Ok(events) => events,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Snapshot rollback failed");
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        let counts = ChangeCounts::of(&events);
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            listed,
            added = counts.added,
            modified = counts.modified,
            deleted = counts.deleted,
            duration_ms,
            "Scan completed"
        );

        let mut stats = self.stats.lock().await;
        stats.total_scans += 1;
        stats.last_scan_at = Some(now);
        stats.last_scan_duration_ms = duration_ms;
        stats.last_changes = counts;

        Ok(events)
    }

    /// Delete snapshot records not observed within `retention`.
    ///
    /// Records under the scan root are refreshed by every scan, so this only
    /// catches entries orphaned by a root change or an interrupted history.
    pub async fn sweep_expired(&self, retention: chrono::Duration) -> Result<u64> {
        let _guard = self.scan_lock.lock().await;
        let cutoff = self.clock.now() - retention;

        let mut tx = self.store.begin().await?;
        let removed = match tx.delete_older_than(cutoff).await {
            Ok(removed) => removed,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Snapshot rollback failed");
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Swept expired snapshot records");
        }
        self.stats.lock().await.records_swept += removed;
        Ok(removed)
    }
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner").finish_non_exhaustive()
    }
}

async fn diff_and_apply(
    tx: &mut dyn SnapshotTransaction,
    root: &str,
    observed: Vec<FileRecord>,
) -> Result<Vec<ChangeEvent>> {
    let ids: Vec<String> = observed.iter().map(|r| r.remote_id.clone()).collect();
    let known: HashMap<String, FileRecord> = tx
        .get_by_ids(&ids)
        .await?
        .into_iter()
        .map(|record| (record.remote_id.clone(), record))
        .collect();

    let mut events = Vec::new();
    let mut persisted = Vec::with_capacity(observed.len());
    for record in &observed {
        match known.get(&record.remote_id) {
            None => {
                events.push(ChangeEvent::added(record.clone()));
                persisted.push(record.clone());
            }
            Some(previous) if previous.path != record.path => {
                debug!(from = %previous.path, to = %record.path, "Entry moved");
                events.push(ChangeEvent::deleted(previous.clone()));
                events.push(ChangeEvent::added(record.clone()));
                persisted.push(merge_observed(previous, record));
            }
            Some(previous) if record.modified_time > previous.modified_time => {
                events.push(ChangeEvent::modified(record.clone()));
                persisted.push(record.clone());
            }
            Some(previous) => persisted.push(merge_observed(previous, record)),
        }
    }

    let listed: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut gone: Vec<FileRecord> = tx
        .list_under(root)
        .await?
        .into_iter()
        .filter(|record| !listed.contains(record.remote_id.as_str()))
        .collect();
    gone.sort_by(|a, b| a.path.cmp(&b.path));

    let gone_ids: Vec<String> = gone.iter().map(|r| r.remote_id.clone()).collect();
    tx.delete_by_ids(&gone_ids).await?;
    tx.upsert(&persisted).await?;

    events.extend(gone.into_iter().map(ChangeEvent::deleted));
    Ok(events)
}

/// Keeps the stored metadata unless `observed` carries a strictly newer
/// modification time. Location and check time always follow the listing.
fn merge_observed(previous: &FileRecord, observed: &FileRecord) -> FileRecord {
    if observed.modified_time > previous.modified_time {
        return observed.clone();
    }
    FileRecord {
        path: observed.path.clone(),
        last_checked: observed.last_checked,
        ..previous.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::error::SyncError;
    use crate::models::ChangeKind;
    use crate::repository::SqliteSnapshotStore;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::remote::RemoteEntry;
    use bridge_traits::time::ManualClock;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Replays one queued listing per call.
    struct ScriptedLister {
        listings: StdMutex<VecDeque<BridgeResult<Vec<RemoteEntry>>>>,
    }

    impl ScriptedLister {
        fn new(listings: Vec<Vec<RemoteEntry>>) -> Self {
            Self {
                listings: StdMutex::new(listings.into_iter().map(Ok).collect()),
            }
        }

        fn then_fail(self, error: BridgeError) -> Self {
            self.listings.lock().unwrap().push_back(Err(error));
            self
        }
    }

    #[async_trait]
    impl RemoteLister for ScriptedLister {
        async fn list(&self, _root: &str) -> BridgeResult<Vec<RemoteEntry>> {
            self.listings
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap()
    }

    async fn scanner_with(
        lister: ScriptedLister,
    ) -> (Scanner, Arc<SqliteSnapshotStore>, Arc<ManualClock>) {
        let store = Arc::new(SqliteSnapshotStore::new(create_test_pool().await.unwrap()));
        store.initialize().await.unwrap();
        let clock = Arc::new(ManualClock::new(at(30)));
        let scanner = Scanner::new(Arc::new(lister), store.clone(), clock.clone());
        (scanner, store, clock)
    }

    fn kinds(events: &[ChangeEvent]) -> Vec<(ChangeKind, &str)> {
        events.iter().map(|e| (e.kind, e.path())).collect()
    }

    #[tokio::test]
    async fn test_first_scan_reports_additions() {
        let lister = ScriptedLister::new(vec![vec![
            RemoteEntry::directory("d1", "movies", at(0)),
            RemoteEntry::file("f1", "/movies/a.mkv", at(0), 10),
        ]]);
        let (scanner, store, _) = scanner_with(lister).await;

        let events = scanner.scan("movies").await.unwrap();
        assert_eq!(
            kinds(&events),
            vec![(ChangeKind::Added, "movies"), (ChangeKind::Added, "movies/a.mkv")]
        );
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_scan_is_empty() {
        let listing = vec![RemoteEntry::file("f1", "movies/a.mkv", at(0), 10)];
        let lister = ScriptedLister::new(vec![listing.clone(), listing]);
        let (scanner, _, _) = scanner_with(lister).await;

        scanner.scan("movies").await.unwrap();
        assert!(scanner.scan("movies").await.unwrap().is_empty());
        assert_eq!(scanner.stats().await.total_scans, 2);
    }

    #[tokio::test]
    async fn test_only_newer_mtime_is_modified() {
        let lister = ScriptedLister::new(vec![
            vec![
                RemoteEntry::file("f1", "movies/a.mkv", at(5), 10),
                RemoteEntry::file("f2", "movies/b.mkv", at(5), 10),
            ],
            vec![
                RemoteEntry::file("f1", "movies/a.mkv", at(6), 20),
                RemoteEntry::file("f2", "movies/b.mkv", at(4), 30),
            ],
        ]);
        let (scanner, store, _) = scanner_with(lister).await;

        scanner.scan("movies").await.unwrap();
        let events = scanner.scan("movies").await.unwrap();
        assert_eq!(kinds(&events), vec![(ChangeKind::Modified, "movies/a.mkv")]);

        // An older mtime never replaces the stored metadata
        let b = store.find_by_path("movies/b.mkv").await.unwrap().unwrap();
        assert_eq!(b.modified_time, at(5));
        assert_eq!(b.size, 10);
        assert_eq!(b.last_checked, at(30));
    }

    #[tokio::test]
    async fn test_modified_time_never_goes_backwards() {
        let lister = ScriptedLister::new(vec![
            vec![RemoteEntry::file("f1", "movies/a.mkv", at(5), 10)],
            vec![RemoteEntry::file("f1", "movies/a.mkv", at(4), 10)],
            vec![RemoteEntry::file("f1", "movies/a.mkv", at(5), 10)],
        ]);
        let (scanner, store, clock) = scanner_with(lister).await;

        scanner.scan("movies").await.unwrap();
        clock.advance(chrono::Duration::minutes(1));
        assert!(scanner.scan("movies").await.unwrap().is_empty());

        let record = store.find_by_path("movies/a.mkv").await.unwrap().unwrap();
        assert_eq!(record.modified_time, at(5));
        assert_eq!(record.last_checked, at(31));

        assert!(scanner.scan("movies").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_keeps_newest_metadata() {
        let lister = ScriptedLister::new(vec![
            vec![RemoteEntry::file("f1", "movies/old.mkv", at(5), 10)],
            vec![RemoteEntry::file("f1", "movies/new.mkv", at(3), 99)],
        ]);
        let (scanner, store, _) = scanner_with(lister).await;

        scanner.scan("movies").await.unwrap();
        scanner.scan("movies").await.unwrap();

        assert!(store.find_by_path("movies/old.mkv").await.unwrap().is_none());
        let moved = store.find_by_path("movies/new.mkv").await.unwrap().unwrap();
        assert_eq!(moved.modified_time, at(5));
        assert_eq!(moved.size, 10);
    }

    struct HangingLister;

    #[async_trait]
    impl RemoteLister for HangingLister {
        async fn list(&self, _root: &str) -> BridgeResult<Vec<RemoteEntry>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancel_while_listing_leaves_snapshot_untouched() {
        let store = Arc::new(SqliteSnapshotStore::new(create_test_pool().await.unwrap()));
        store.initialize().await.unwrap();
        let scanner = Scanner::new(
            Arc::new(HangingLister),
            store.clone(),
            Arc::new(ManualClock::new(at(0))),
        );

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = scanner.scan_until_cancelled("movies", &token).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(scanner.stats().await.total_scans, 0);
    }

    #[tokio::test]
    async fn test_missing_entries_are_deleted_sorted() {
        let lister = ScriptedLister::new(vec![
            vec![
                RemoteEntry::file("f3", "movies/c.mkv", at(0), 1),
                RemoteEntry::file("f1", "movies/a.mkv", at(0), 1),
                RemoteEntry::file("f2", "movies/b.mkv", at(0), 1),
            ],
            vec![RemoteEntry::file("f2", "movies/b.mkv", at(0), 1)],
        ]);
        let (scanner, store, _) = scanner_with(lister).await;

        scanner.scan("movies").await.unwrap();
        let events = scanner.scan("movies").await.unwrap();
        assert_eq!(
            kinds(&events),
            vec![
                (ChangeKind::Deleted, "movies/a.mkv"),
                (ChangeKind::Deleted, "movies/c.mkv")
            ]
        );
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rename_is_delete_then_add() {
        let lister = ScriptedLister::new(vec![
            vec![RemoteEntry::file("f1", "movies/old.mkv", at(0), 1)],
            vec![RemoteEntry::file("f1", "movies/new.mkv", at(0), 1)],
        ]);
        let (scanner, store, _) = scanner_with(lister).await;

        scanner.scan("movies").await.unwrap();
        let events = scanner.scan("movies").await.unwrap();
        assert_eq!(
            kinds(&events),
            vec![
                (ChangeKind::Deleted, "movies/old.mkv"),
                (ChangeKind::Added, "movies/new.mkv")
            ]
        );
        assert!(store.find_by_path("movies/old.mkv").await.unwrap().is_none());
        assert!(store.find_by_path("movies/new.mkv").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicates_keep_first_occurrence() {
        let lister = ScriptedLister::new(vec![vec![
            RemoteEntry::file("f1", "movies/a.mkv", at(0), 1),
            RemoteEntry::file("f2", "movies/a.mkv", at(0), 2),
            RemoteEntry::file("f1", "movies/b.mkv", at(0), 3),
        ]]);
        let (scanner, store, _) = scanner_with(lister).await;

        let events = scanner.scan("movies").await.unwrap();
        assert_eq!(kinds(&events), vec![(ChangeKind::Added, "movies/a.mkv")]);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_records_outside_root_untouched() {
        let lister = ScriptedLister::new(vec![
            vec![RemoteEntry::file("t1", "tv/show.mkv", at(0), 1)],
            vec![RemoteEntry::file("m1", "movies/a.mkv", at(0), 1)],
        ]);
        let (scanner, store, _) = scanner_with(lister).await;

        scanner.scan("tv").await.unwrap();
        let events = scanner.scan("movies").await.unwrap();
        assert_eq!(kinds(&events), vec![(ChangeKind::Added, "movies/a.mkv")]);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_listing_failure_leaves_snapshot() {
        let lister = ScriptedLister::new(vec![vec![RemoteEntry::file(
            "f1",
            "movies/a.mkv",
            at(0),
            1,
        )]])
        .then_fail(BridgeError::Transient("timeout".into()));
        let (scanner, store, _) = scanner_with(lister).await;

        scanner.scan("movies").await.unwrap();
        let result = scanner.scan("movies").await;
        assert!(matches!(result, Err(SyncError::Remote(_))));
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(scanner.stats().await.total_scans, 1);
    }

    #[tokio::test]
    async fn test_sweep_expired_uses_last_checked() {
        let lister = ScriptedLister::new(vec![
            vec![RemoteEntry::file("t1", "tv/show.mkv", at(0), 1)],
            vec![RemoteEntry::file("m1", "movies/a.mkv", at(0), 1)],
        ]);
        let (scanner, store, clock) = scanner_with(lister).await;

        scanner.scan("tv").await.unwrap();
        clock.advance(chrono::Duration::days(40));
        scanner.scan("movies").await.unwrap();

        let removed = scanner.sweep_expired(chrono::Duration::days(30)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_by_path("tv/show.mkv").await.unwrap().is_none());
        assert_eq!(scanner.stats().await.records_swept, 1);
    }

    // ------------------------------------------------------------------------
    // Failing transaction
    // ------------------------------------------------------------------------

    struct FailingUpsertStore {
        inner: SqliteSnapshotStore,
    }

    struct FailingUpsertTransaction {
        inner: Box<dyn SnapshotTransaction>,
    }

    #[async_trait]
    impl SnapshotStore for FailingUpsertStore {
        async fn begin(&self) -> Result<Box<dyn SnapshotTransaction>> {
            Ok(Box::new(FailingUpsertTransaction {
                inner: self.inner.begin().await?,
            }))
        }

        async fn find_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
            self.inner.find_by_path(path).await
        }

        async fn list_files(&self) -> Result<Vec<FileRecord>> {
            self.inner.list_files().await
        }

        async fn count(&self) -> Result<u64> {
            self.inner.count().await
        }
    }

    #[async_trait]
    impl SnapshotTransaction for FailingUpsertTransaction {
        async fn get_by_ids(&mut self, ids: &[String]) -> Result<Vec<FileRecord>> {
            self.inner.get_by_ids(ids).await
        }

        async fn list_under(&mut self, root: &str) -> Result<Vec<FileRecord>> {
            self.inner.list_under(root).await
        }

        async fn upsert(&mut self, _records: &[FileRecord]) -> Result<()> {
            Err(SyncError::Database("disk I/O error".into()))
        }

        async fn delete_by_ids(&mut self, ids: &[String]) -> Result<u64> {
            self.inner.delete_by_ids(ids).await
        }

        async fn delete_older_than(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
            self.inner.delete_older_than(cutoff).await
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<()> {
            self.inner.rollback().await
        }
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_deletions() {
        let pool = create_test_pool().await.unwrap();
        let sqlite = SqliteSnapshotStore::new(pool);
        sqlite.initialize().await.unwrap();

        let mut tx = sqlite.begin().await.unwrap();
        tx.upsert(&[FileRecord::from_entry(
            &RemoteEntry::file("f1", "movies/a.mkv", at(0), 1),
            "movies/a.mkv".into(),
            at(0),
        )])
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let store = Arc::new(FailingUpsertStore {
            inner: sqlite.clone(),
        });
        let lister = ScriptedLister::new(vec![vec![RemoteEntry::file("f2", "movies/b.mkv", at(0), 1)]]);
        let scanner = Scanner::new(Arc::new(lister), store, Arc::new(ManualClock::new(at(30))));

        let result = scanner.scan("movies").await;
        assert!(matches!(result, Err(SyncError::Database(_))));
        // The deletion of f1 happened before the failing upsert and was undone
        assert!(sqlite.find_by_path("movies/a.mkv").await.unwrap().is_some());
        assert_eq!(sqlite.count().await.unwrap(), 1);
    }
}
