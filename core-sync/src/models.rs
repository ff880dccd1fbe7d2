//! Snapshot records and the change events derived from them.

use bridge_traits::remote::RemoteEntry;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Last observed state of one remote entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Normalized path relative to the store root
    pub path: String,
    /// Stable provider identifier, survives renames
    pub remote_id: String,
    pub modified_time: DateTime<Utc>,
    pub size: u64,
    pub is_directory: bool,
    pub mime_type: Option<String>,
    /// When a scan last saw this entry
    pub last_checked: DateTime<Utc>,
}

impl FileRecord {
    /// Builds the record for `entry` as observed at `checked_at`.
    ///
    /// `path` must already be normalized. Timestamps are truncated to the
    /// millisecond precision the snapshot stores.
    pub fn from_entry(entry: &RemoteEntry, path: String, checked_at: DateTime<Utc>) -> Self {
        Self {
            path,
            remote_id: entry.id.clone(),
            modified_time: entry.modified_time.trunc_subsecs(3),
            size: entry.size,
            is_directory: entry.is_directory(),
            mime_type: entry.mime_type.clone(),
            last_checked: checked_at.trunc_subsecs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected difference between the remote listing and the snapshot.
///
/// For deletions `record` is the last known state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: FileRecord,
}

impl ChangeEvent {
    pub fn added(record: FileRecord) -> Self {
        Self {
            kind: ChangeKind::Added,
            record,
        }
    }

    pub fn modified(record: FileRecord) -> Self {
        Self {
            kind: ChangeKind::Modified,
            record,
        }
    }

    pub fn deleted(record: FileRecord) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            record,
        }
    }

    pub fn path(&self) -> &str {
        &self.record.path
    }
}

/// Counts of each change kind in a scan result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: u64,
    pub modified: u64,
    pub deleted: u64,
}

impl ChangeCounts {
    pub fn of(events: &[ChangeEvent]) -> Self {
        events.iter().fold(Self::default(), |mut counts, event| {
            match event.kind {
                ChangeKind::Added => counts.added += 1,
                ChangeKind::Modified => counts.modified += 1,
                ChangeKind::Deleted => counts.deleted += 1,
            }
            counts
        })
    }

    pub fn total(&self) -> u64 {
        self.added + self.modified + self.deleted
    }
}

/// Canonical relative form: forward slashes, no empty, `.` or leading/trailing
/// segments.
pub fn normalize_path(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether normalized `path` lies at or beneath normalized `root`.
///
/// The empty root covers everything.
pub fn is_under_root(path: &str, root: &str) -> bool {
    root.is_empty()
        || path == root
        || path
            .strip_prefix(root)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}
