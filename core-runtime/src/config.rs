//! # Core Configuration Module
//!
//! Provides configuration management for the sync core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds every setting the pipeline needs: where the snapshot
//! database lives, how often to scan, how events are batched, where links are
//! projected and how local paths map onto the media server.
//!
//! Every settings group derives `serde` traits with per-field defaults, so a
//! host can load them from whatever format it already uses and only override
//! what differs.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder()
//!     .database_path("data/graylink.db")
//!     .source_dir("/mnt/media/nastool")
//!     .target_dir("/mnt/nastool-nfo")
//!     .path_mapping("/mnt/nastool-nfo", "/media")
//!     .build()
//!     .expect("Failed to build config");
//! ```
//!
//! ## Error Handling
//!
//! The builder validates all values fail-fast and returns
//! [`Error::Config`] with an actionable message:
//!
//! ```should_panic
//! use core_runtime::config::CoreConfig;
//!
//! // Missing source and target directories
//! let config = CoreConfig::builder()
//!     .database_path("data/graylink.db")
//!     .build()
//!     .expect("Should fail - missing link directories");
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Scans faster than this hammer the provider's rate limits.
pub const MIN_SCAN_INTERVAL_MS: u64 = 60_000;

/// Core configuration for the sync pipeline.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Path to the SQLite database holding the snapshot
    pub database_path: PathBuf,

    pub monitor: MonitorSettings,

    pub batch: BatchSettings,

    pub symlink: SymlinkSettings,

    pub media: MediaServerSettings,
}

/// Scan scheduling and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Remote root to scan. Empty means the whole store.
    pub scan_root: String,
    pub scan_interval_ms: u64,
    /// Consecutive failed scans tolerated before the loop stops
    pub max_retries: u32,
    /// Base delay for linear backoff (`retry_delay * retry_count`)
    pub retry_delay_ms: u64,
    /// Records not confirmed by a scan for this long are swept
    pub retention_days: u32,
    pub sweep_interval_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            scan_root: String::new(),
            scan_interval_ms: 300_000,
            max_retries: 3,
            retry_delay_ms: 5_000,
            retention_days: 30,
            sweep_interval_ms: 3_600_000,
        }
    }
}

impl MonitorSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

/// Count-or-timeout batching policy for change events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    /// Bound of the queue between the monitor and the batcher
    pub queue_capacity: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_interval_ms: 1_000,
            queue_capacity: 1_000,
        }
    }
}

impl BatchSettings {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }
}

/// Where links are projected from and to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymlinkSettings {
    /// Local mount of the remote store; link targets point here
    pub source_dir: PathBuf,
    /// Tree of symlinks the media server scans
    pub target_dir: PathBuf,
    /// Where link manifests are written before a rebuild
    pub backup_dir: PathBuf,
    pub verify_cache_ttl_ms: u64,
    pub backup_retention_days: u32,
}

impl Default for SymlinkSettings {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::new(),
            target_dir: PathBuf::new(),
            backup_dir: PathBuf::from("data/backup"),
            verify_cache_ttl_ms: 30_000,
            backup_retention_days: 30,
        }
    }
}

impl SymlinkSettings {
    pub fn verify_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.verify_cache_ttl_ms)
    }

    pub fn backup_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.backup_retention_days))
    }
}

/// Media server integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaServerSettings {
    pub enabled: bool,
    /// Local path prefix -> server path prefix
    pub path_mapping: BTreeMap<String, String>,
}

impl Default for MediaServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path_mapping: BTreeMap::new(),
        }
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Database path, source and target directories are set
    /// - Source and target directories differ
    /// - Scan interval respects the provider floor
    /// - Batch size, interval and queue capacity are consistent
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.symlink.source_dir.as_os_str().is_empty() {
            return Err(Error::Config("Source directory cannot be empty".to_string()));
        }

        if self.symlink.target_dir.as_os_str().is_empty() {
            return Err(Error::Config("Target directory cannot be empty".to_string()));
        }

        if self.symlink.source_dir == self.symlink.target_dir {
            return Err(Error::Config(
                "Source and target directories must differ".to_string(),
            ));
        }

        if self.monitor.scan_interval_ms < MIN_SCAN_INTERVAL_MS {
            return Err(Error::Config(format!(
                "Scan interval must be at least {}ms, got {}ms",
                MIN_SCAN_INTERVAL_MS, self.monitor.scan_interval_ms
            )));
        }

        if self.monitor.retention_days == 0 {
            return Err(Error::Config(
                "Retention window must be at least 1 day".to_string(),
            ));
        }

        if self.batch.batch_size == 0 {
            return Err(Error::Config(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.batch.batch_interval_ms == 0 {
            return Err(Error::Config(
                "Batch interval must be greater than 0ms".to_string(),
            ));
        }

        if self.batch.queue_capacity < self.batch.batch_size {
            return Err(Error::Config(format!(
                "Queue capacity ({}) must be at least the batch size ({})",
                self.batch.queue_capacity, self.batch.batch_size
            )));
        }

        for (local, server) in &self.media.path_mapping {
            if local.trim().is_empty() || server.trim().is_empty() {
                return Err(Error::Config(
                    "Path mapping entries cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Builder for constructing [`CoreConfig`] instances.
///
/// Use this builder to incrementally set configuration options and then
/// call [`build()`](CoreConfigBuilder::build) to create the final config.
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    monitor: MonitorSettings,
    batch: BatchSettings,
    symlink: SymlinkSettings,
    media: MediaServerSettings,
}

impl CoreConfigBuilder {
    /// Sets the database path.
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the local mount of the remote store.
    pub fn source_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.symlink.source_dir = path.into();
        self
    }

    /// Sets the directory where symlinks are projected.
    pub fn target_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.symlink.target_dir = path.into();
        self
    }

    /// Sets the directory for link manifests.
    ///
    /// Default: `data/backup`
    pub fn backup_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.symlink.backup_dir = path.into();
        self
    }

    /// Sets the remote root to scan.
    pub fn scan_root(mut self, root: impl Into<String>) -> Self {
        self.monitor.scan_root = root.into();
        self
    }

    /// Sets the interval between scans.
    ///
    /// Default: 5 minutes. Minimum: 60 seconds.
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.monitor.scan_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the retry policy for failed scans.
    ///
    /// Default: 3 retries, 5 second base delay
    pub fn retry_policy(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.monitor.max_retries = max_retries;
        self.monitor.retry_delay_ms = retry_delay.as_millis() as u64;
        self
    }

    /// Sets the batching policy.
    ///
    /// Default: 10 events or 1 second, whichever comes first
    pub fn batching(mut self, batch_size: usize, batch_interval: Duration) -> Self {
        self.batch.batch_size = batch_size;
        self.batch.batch_interval_ms = batch_interval.as_millis() as u64;
        self
    }

    /// Adds a local -> media server path prefix mapping.
    pub fn path_mapping(mut self, local: impl Into<String>, server: impl Into<String>) -> Self {
        self.media.path_mapping.insert(local.into(), server.into());
        self
    }

    /// Enables or disables media server refreshes.
    ///
    /// Default: true
    pub fn media_server_enabled(mut self, enabled: bool) -> Self {
        self.media.enabled = enabled;
        self
    }

    /// Replaces the monitor settings wholesale.
    pub fn monitor(mut self, settings: MonitorSettings) -> Self {
        self.monitor = settings;
        self
    }

    /// Replaces the batch settings wholesale.
    pub fn batch(mut self, settings: BatchSettings) -> Self {
        self.batch = settings;
        self
    }

    /// Replaces the symlink settings wholesale.
    pub fn symlink(mut self, settings: SymlinkSettings) -> Self {
        self.symlink = settings;
        self
    }

    /// Replaces the media server settings wholesale.
    pub fn media(mut self, settings: MediaServerSettings) -> Self {
        self.media = settings;
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Returns
    ///
    /// Returns `Ok(CoreConfig)` on success, or an error if a required value
    /// is missing or any value is out of range.
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let config = CoreConfig {
            database_path,
            monitor: self.monitor,
            batch: self.batch,
            symlink: self.symlink,
            media: self.media,
        };

        config.validate()?;

        Ok(config)
    }
}
