//! # Symlink Projector
//!
//! Maps remote relative paths onto a local tree of symbolic links.
//!
//! ## Overview
//!
//! For a relative path `p` the projector links `target_root/p -> source_root/p`.
//! The filesystem is the source of truth; the in-memory [`SymlinkEntry`] map is
//! a cache that [`SymlinkProjector::load`] rebuilds from a walk of the target
//! tree.
//!
//! Conflict policy is backup-and-overwrite: a regular file or directory that
//! occupies a link location is renamed to `<original>.bak.<timestamp>` first.
//!
//! Expected misses (missing source, nothing to remove) return `Ok(false)`.
//! Only unexpected I/O failures are errors.

use async_trait::async_trait;
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use core_runtime::cache::TtlCache;
use core_runtime::config::SymlinkSettings;
use core_runtime::logging::strip_path;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::backup::{self, LinkManifest, ManifestLink};
use crate::error::{LinkError, Result};

const VERIFY_KEY: &str = "verify";

// ============================================================================
// Types
// ============================================================================

/// Cached view of one link on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkEntry {
    /// Absolute path the link points at
    pub source: PathBuf,
    /// Absolute path of the link itself
    pub target: PathBuf,
    pub valid: bool,
    pub created_at: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
}

/// Link classification counts returned by verify and rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReport {
    pub valid: u64,
    pub invalid: u64,
    pub missing: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectorStats {
    pub created: u64,
    pub removed: u64,
    pub failed: u64,
    pub backups: u64,
    pub last_operation_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Link operations the event batcher needs.
#[async_trait]
pub trait LinkProjection: Send + Sync {
    /// Absolute local path of the link for `relative_path`.
    fn target_path(&self, relative_path: &str) -> Result<PathBuf>;

    /// Ensure `target/relative_path` links to `source/relative_path`.
    ///
    /// Returns `Ok(false)` when the source does not exist.
    async fn create(&self, relative_path: &str) -> Result<bool>;

    /// Delete the link for `relative_path` and prune empty parents.
    ///
    /// Returns `Ok(false)` when there was no link to delete.
    async fn remove(&self, relative_path: &str) -> Result<bool>;
}

/// A link found while walking the target tree.
#[derive(Debug, Clone)]
struct WalkedLink {
    target: PathBuf,
    source: PathBuf,
    valid: bool,
}

// ============================================================================
// Projector
// ============================================================================

pub struct SymlinkProjector {
    source_root: PathBuf,
    target_root: PathBuf,
    backup_dir: PathBuf,
    verify_ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<PathBuf, SymlinkEntry>>,
    verify_cache: TtlCache<&'static str, LinkReport>,
    stats: Mutex<ProjectorStats>,
}

impl SymlinkProjector {
    pub fn new(settings: &SymlinkSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            source_root: settings.source_dir.clone(),
            target_root: settings.target_dir.clone(),
            backup_dir: settings.backup_dir.clone(),
            verify_ttl: settings.verify_cache_ttl(),
            clock,
            entries: RwLock::new(HashMap::new()),
            verify_cache: TtlCache::new(1),
            stats: Mutex::new(ProjectorStats::default()),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn target_root(&self) -> &Path {
        &self.target_root
    }

    /// Repopulates the entry cache from the links currently on disk.
    pub async fn load(&self) -> Result<usize> {
        let walked = self.walk_links().await?;
        let count = walked.len();
        self.replace_entries(walked).await;
        info!(links = count, "Loaded existing links");
        Ok(count)
    }

    /// Every cached link, sorted by target path.
    pub async fn get_all(&self) -> Vec<SymlinkEntry> {
        let mut all: Vec<SymlinkEntry> = self.entries.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    pub async fn stats(&self) -> ProjectorStats {
        self.stats.lock().await.clone()
    }

    /// Classifies every link under the target root.
    ///
    /// `valid` links resolve to an existing path under the source root,
    /// `invalid` links resolve elsewhere or dangle, and `missing` counts cached
    /// entries whose link is gone from disk. Results are cached for the
    /// configured TTL.
    pub async fn verify(&self) -> Result<LinkReport> {
        let (report, status) = self
            .verify_cache
            .get_or_try_insert_with(VERIFY_KEY, self.verify_ttl, || self.verify_uncached())
            .await?;
        debug!(cached = status.is_hit(), ?report, "Link verification");
        Ok(report)
    }

    async fn verify_uncached(&self) -> Result<LinkReport> {
        let walked = self.walk_links().await?;
        let on_disk: HashSet<&PathBuf> = walked.iter().map(|link| &link.target).collect();

        let missing = self
            .entries
            .read()
            .await
            .keys()
            .filter(|target| !on_disk.contains(target))
            .count() as u64;

        let valid = walked.iter().filter(|link| link.valid).count() as u64;
        let report = LinkReport {
            valid,
            invalid: walked.len() as u64 - valid,
            missing,
        };

        self.replace_entries(walked).await;
        Ok(report)
    }

    /// Clears every link (after writing a manifest) and recreates links for
    /// `relative_paths`. Paths whose source is missing are counted, not
    /// attempted.
    #[instrument(skip(self, relative_paths), fields(records = relative_paths.len()))]
    pub async fn rebuild(&self, relative_paths: &[String]) -> Result<LinkReport> {
        let cleared = self.clear().await?;
        let mut report = LinkReport::default();

        for path in relative_paths {
            let source = match sanitize(path) {
                Ok(rel) => self.source_root.join(rel),
                Err(e) => {
                    warn!(path = %path, error = %e, "Skipping unprojectable path");
                    report.invalid += 1;
                    continue;
                }
            };

            if !path_exists(&source).await? {
                report.missing += 1;
                continue;
            }

            match self.create(path).await {
                Ok(true) => report.valid += 1,
                Ok(false) => report.missing += 1,
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to recreate link");
                    report.invalid += 1;
                }
            }
        }

        self.verify_cache.clear().await;
        info!(cleared, ?report, "Rebuilt links");
        Ok(report)
    }

    /// Removes every link under the target root, writing a manifest of what
    /// was removed into the backup directory first.
    pub async fn clear(&self) -> Result<usize> {
        let walked = self.walk_links().await?;
        if walked.is_empty() {
            self.entries.write().await.clear();
            return Ok(0);
        }

        let manifest = LinkManifest {
            created_at: self.clock.now(),
            source_root: self.source_root.clone(),
            target_root: self.target_root.clone(),
            links: walked
                .iter()
                .map(|link| ManifestLink {
                    target: link.target.clone(),
                    source: link.source.clone(),
                })
                .collect(),
        };
        let manifest_path = backup::write_manifest(&self.backup_dir, &manifest).await?;
        info!(manifest = %manifest_path.display(), links = walked.len(), "Saved link manifest");

        for link in &walked {
            remove_link(&link.target).await?;
            self.prune_empty_parents(&link.target).await?;
        }

        self.entries.write().await.clear();
        self.verify_cache.clear().await;
        Ok(walked.len())
    }

    /// Deletes backup files older than `max_age` from the target tree and
    /// the backup directory.
    pub async fn cleanup_backups(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = self.clock.now() - max_age;
        let roots = vec![self.target_root.clone(), self.backup_dir.clone()];
        let expired = tokio::task::spawn_blocking(move || backup::expired_backups(&roots, cutoff))
            .await
            .map_err(|e| LinkError::Walk(e.to_string()))?;

        let mut removed = 0;
        for path in expired {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(LinkError::io(&path)(e)),
            }
        }

        if removed > 0 {
            info!(removed, "Removed expired backups");
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn walk_links(&self) -> Result<Vec<WalkedLink>> {
        let source_root = self.source_root.clone();
        let target_root = self.target_root.clone();
        tokio::task::spawn_blocking(move || scan_links(&source_root, &target_root))
            .await
            .map_err(|e| LinkError::Walk(e.to_string()))
    }

    async fn replace_entries(&self, walked: Vec<WalkedLink>) {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let mut refreshed = HashMap::with_capacity(walked.len());
        for link in walked {
            let created_at = entries
                .get(&link.target)
                .map(|entry| entry.created_at)
                .unwrap_or(now);
            refreshed.insert(
                link.target.clone(),
                SymlinkEntry {
                    source: link.source,
                    target: link.target,
                    valid: link.valid,
                    created_at,
                    last_checked: now,
                },
            );
        }
        *entries = refreshed;
    }

    async fn record_success(&self, created: bool) {
        let mut stats = self.stats.lock().await;
        if created {
            stats.created += 1;
        } else {
            stats.removed += 1;
        }
        stats.last_operation_at = Some(self.clock.now());
    }

    async fn record_failure(&self, message: String) {
        let mut stats = self.stats.lock().await;
        stats.failed += 1;
        stats.last_operation_at = Some(self.clock.now());
        stats.last_error = Some(message);
    }

    async fn create_inner(&self, rel: &Path, source: &Path, target: &Path) -> Result<bool> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(LinkError::io(parent))?;
        }

        match fs::symlink_metadata(target).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                let current = fs::read_link(target).await.map_err(LinkError::io(target))?;
                if current == source {
                    let now = self.clock.now();
                    if let Some(entry) = self.entries.write().await.get_mut(target) {
                        entry.valid = true;
                        entry.last_checked = now;
                    }
                    return Ok(true);
                }
                debug!(
                    path = %rel.display(),
                    previous = %current.display(),
                    "Replacing link pointing elsewhere"
                );
                remove_link(target).await?;
            }
            Ok(_) => {
                let backup_path = backup::next_backup_path(target, self.clock.now()).await?;
                fs::rename(target, &backup_path)
                    .await
                    .map_err(LinkError::io(target))?;
                self.stats.lock().await.backups += 1;
                info!(
                    file = %strip_path(&target.to_string_lossy()),
                    backup = %backup_path.display(),
                    "Backed up existing file before linking"
                );
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(LinkError::io(target)(e)),
        }

        make_symlink(source, target)
            .await
            .map_err(LinkError::io(target))?;

        let now = self.clock.now();
        self.entries.write().await.insert(
            target.to_path_buf(),
            SymlinkEntry {
                source: source.to_path_buf(),
                target: target.to_path_buf(),
                valid: true,
                created_at: now,
                last_checked: now,
            },
        );
        self.record_success(true).await;
        debug!(path = %rel.display(), "Created link");
        Ok(true)
    }

    async fn remove_inner(&self, rel: &Path, target: &Path) -> Result<bool> {
        self.entries.write().await.remove(target);

        match fs::symlink_metadata(target).await {
            Ok(meta) if meta.file_type().is_symlink() => {}
            Ok(_) => {
                debug!(path = %rel.display(), "Not a link, leaving in place");
                return Ok(false);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(LinkError::io(target)(e)),
        }

        remove_link(target).await?;
        self.prune_empty_parents(target).await?;
        self.record_success(false).await;
        debug!(path = %rel.display(), "Removed link");
        Ok(true)
    }

    /// Removes now-empty directories from `path`'s parent upward, never
    /// touching the target root itself.
    async fn prune_empty_parents(&self, path: &Path) -> Result<()> {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.target_root || !dir.starts_with(&self.target_root) {
                break;
            }

            let mut listing = match fs::read_dir(dir).await {
                Ok(listing) => listing,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    current = dir.parent();
                    continue;
                }
                Err(e) => return Err(LinkError::io(dir)(e)),
            };
            if listing
                .next_entry()
                .await
                .map_err(LinkError::io(dir))?
                .is_some()
            {
                break;
            }

            if let Err(e) = fs::remove_dir(dir).await {
                // Something landed in the directory since we looked
                debug!(dir = %dir.display(), error = %e, "Stopped pruning");
                break;
            }
            current = dir.parent();
        }
        Ok(())
    }
}

#[async_trait]
impl LinkProjection for SymlinkProjector {
    fn target_path(&self, relative_path: &str) -> Result<PathBuf> {
        Ok(self.target_root.join(sanitize(relative_path)?))
    }

    #[instrument(skip(self))]
    async fn create(&self, relative_path: &str) -> Result<bool> {
        let rel = sanitize(relative_path)?;
        let source = self.source_root.join(&rel);
        let target = self.target_root.join(&rel);

        if !path_exists(&source).await? {
            warn!(path = %relative_path, "Source does not exist, link not created");
            self.record_failure(format!("source missing: {}", relative_path))
                .await;
            return Ok(false);
        }

        let result = self.create_inner(&rel, &source, &target).await;
        if let Err(e) = &result {
            self.record_failure(e.to_string()).await;
        }
        result
    }

    #[instrument(skip(self))]
    async fn remove(&self, relative_path: &str) -> Result<bool> {
        let rel = sanitize(relative_path)?;
        let target = self.target_root.join(&rel);

        let result = self.remove_inner(&rel, &target).await;
        if let Err(e) = &result {
            self.record_failure(e.to_string()).await;
        }
        result
    }
}

impl std::fmt::Debug for SymlinkProjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymlinkProjector")
            .field("source_root", &self.source_root)
            .field("target_root", &self.target_root)
            .field("backup_dir", &self.backup_dir)
            .finish()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Turns a snapshot path into a relative filesystem path.
///
/// Backslashes count as separators and leading slashes are ignored; `..`
/// components are rejected so a link can never escape the target root.
fn sanitize(relative_path: &str) -> Result<PathBuf> {
    let normalized = relative_path.replace('\\', "/");
    let mut rel = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(LinkError::InvalidPath(relative_path.to_string())),
            part => rel.push(part),
        }
    }

    let only_normal = rel
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if rel.as_os_str().is_empty() || !only_normal {
        return Err(LinkError::InvalidPath(relative_path.to_string()));
    }
    Ok(rel)
}

async fn path_exists(path: &Path) -> Result<bool> {
    fs::try_exists(path).await.map_err(LinkError::io(path))
}

/// Blocking walk of `target_root` collecting every symlink.
fn scan_links(source_root: &Path, target_root: &Path) -> Vec<WalkedLink> {
    let canonical_source =
        std::fs::canonicalize(source_root).unwrap_or_else(|_| source_root.to_path_buf());

    let mut links = Vec::new();
    for entry in WalkDir::new(target_root).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => break,
            Err(err) => {
                warn!(error = %err, "Skipping unreadable entry during link walk");
                continue;
            }
        };

        if !entry.path_is_symlink() {
            continue;
        }

        let target = entry.into_path();
        let source = match std::fs::read_link(&target) {
            Ok(source) => source,
            Err(err) => {
                warn!(link = %target.display(), error = %err, "Unreadable link");
                continue;
            }
        };

        let valid = std::fs::canonicalize(&target)
            .map(|resolved| resolved.starts_with(&canonical_source))
            .unwrap_or(false);

        links.push(WalkedLink {
            target,
            source,
            valid,
        });
    }
    links
}

#[cfg(unix)]
async fn make_symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    fs::symlink(source, target).await
}

#[cfg(windows)]
async fn make_symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    if fs::metadata(source).await?.is_dir() {
        fs::symlink_dir(source, target).await
    } else {
        fs::symlink_file(source, target).await
    }
}

async fn remove_link(target: &Path) -> Result<()> {
    let result = fs::remove_file(target).await;

    // Directory links on Windows are removed as directories
    #[cfg(windows)]
    let result = match result {
        Err(_) => fs::remove_dir(target).await,
        ok => ok,
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LinkError::io(target)(e)),
    }
}

// ============================================================================
// Tests
// ============================================================================
