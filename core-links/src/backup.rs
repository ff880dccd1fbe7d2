//! Backup naming and retention.
//!
//! A file that a link is about to replace is renamed to
//! `<original>.bak.<YYYYmmdd_HHMMSS>` next to it. Same-second collisions get
//! a `_<n>` suffix. Backups are only ever deleted by [`expired_backups`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{LinkError, Result};

pub const BACKUP_MARKER: &str = ".bak.";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const TIMESTAMP_LEN: usize = 15;

/// Name of the link manifest written before links are cleared.
pub const MANIFEST_PREFIX: &str = "links.json";

pub fn backup_file_name(file_name: &str, at: DateTime<Utc>) -> String {
    format!("{}{}{}", file_name, BACKUP_MARKER, at.format(TIMESTAMP_FORMAT))
}

/// First free backup path for `original` at `at`.
pub async fn next_backup_path(original: &Path, at: DateTime<Utc>) -> Result<PathBuf> {
    let file_name = original
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| LinkError::InvalidPath(original.display().to_string()))?;

    let base = original.with_file_name(backup_file_name(&file_name, at));
    if !exists(&base).await? {
        return Ok(base);
    }

    let mut counter = 1u32;
    loop {
        let candidate = PathBuf::from(format!("{}_{}", base.display(), counter));
        if !exists(&candidate).await? {
            return Ok(candidate);
        }
        counter += 1;
    }
}

/// Parses the timestamp out of a backup file name.
pub fn parse_backup_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let idx = file_name.rfind(BACKUP_MARKER)?;
    let suffix = &file_name[idx + BACKUP_MARKER.len()..];
    if suffix.len() < TIMESTAMP_LEN || !suffix.is_char_boundary(TIMESTAMP_LEN) {
        return None;
    }

    let (stamp, rest) = suffix.split_at(TIMESTAMP_LEN);
    let counter_ok = rest.is_empty()
        || rest
            .strip_prefix('_')
            .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false);
    if !counter_ok {
        return None;
    }

    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Backup files under `roots` whose name timestamp is older than `cutoff`.
///
/// Symlinks are never reported, even when their name looks like a backup.
pub fn expired_backups(roots: &[PathBuf], cutoff: DateTime<Utc>) -> Vec<PathBuf> {
    let mut expired = Vec::new();
    for root in roots {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => break,
                Err(err) => {
                    warn!(error = %err, "Skipping unreadable entry during backup sweep");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            if let Some(stamp) = parse_backup_timestamp(&name) {
                if stamp < cutoff {
                    expired.push(entry.into_path());
                }
            }
        }
    }
    expired
}

/// Record of the links that existed before a bulk clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkManifest {
    pub created_at: DateTime<Utc>,
    pub source_root: PathBuf,
    pub target_root: PathBuf,
    pub links: Vec<ManifestLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestLink {
    /// Link location
    pub target: PathBuf,
    /// Where the link pointed
    pub source: PathBuf,
}

/// Writes `manifest` into `backup_dir` and returns the file path.
pub async fn write_manifest(backup_dir: &Path, manifest: &LinkManifest) -> Result<PathBuf> {
    fs::create_dir_all(backup_dir)
        .await
        .map_err(LinkError::io(backup_dir))?;

    let path = next_backup_path(&backup_dir.join(MANIFEST_PREFIX), manifest.created_at).await?;
    let body = serde_json::to_vec_pretty(manifest)?;
    fs::write(&path, body).await.map_err(LinkError::io(&path))?;
    Ok(path)
}

async fn exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(LinkError::io(path)(e)),
    }
}
