//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (remote lister,
//! media server client, clock) into the sync pipeline. Every component is
//! built exactly once here and shared by reference; nothing else in the
//! workspace constructs collaborators.
//!
//! ```text
//! RemoteLister ─> Scanner ─> EventBatcher ─> SymlinkProjector
//!                   │              │
//!            SnapshotStore         └──────> RefreshNotifier ─> MediaServerClient
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::path::PathBuf;
use std::sync::Arc;

use bridge_traits::{
    media::MediaServerClient,
    remote::RemoteLister,
    time::{Clock, SystemClock},
};
use core_links::{LinkProjection, LinkReport, ProjectorStats, SymlinkEntry, SymlinkProjector};
use core_media::{
    DisabledRefresher, NotifierStats, PathMapping, PathRefresher, RefreshNotifier, RefreshSummary,
};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, LinkEvent, Receiver};
use core_sync::{
    create_pool, BatcherStats, ChangeCounts, DatabaseConfig, EventBatcher, MonitorLoop,
    MonitorStats, Scanner, ScannerStats, SnapshotStore, SqliteSnapshotStore,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Aggregated handle to the bridge dependencies the core requires.
pub struct CoreDependencies {
    pub lister: Arc<dyn RemoteLister>,
    /// Required when the media server integration is enabled
    pub media_client: Option<Arc<dyn MediaServerClient>>,
    pub clock: Arc<dyn Clock>,
}

impl CoreDependencies {
    /// Construct a dependency bundle using the system clock.
    pub fn new(lister: Arc<dyn RemoteLister>) -> Self {
        Self {
            lister,
            media_client: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_media_client(mut self, client: Arc<dyn MediaServerClient>) -> Self {
        self.media_client = Some(client);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Point-in-time view of every component's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub monitor: MonitorStats,
    pub scanner: ScannerStats,
    pub batcher: BatcherStats,
    pub links: ProjectorStats,
    /// `None` when the media server integration is disabled
    pub media: Option<NotifierStats>,
    pub snapshot_records: u64,
}

/// Primary façade exposed to host applications.
pub struct SyncService {
    config: CoreConfig,
    event_bus: EventBus,
    store: Arc<SqliteSnapshotStore>,
    scanner: Arc<Scanner>,
    projector: Arc<SymlinkProjector>,
    refresher: Arc<dyn PathRefresher>,
    notifier: Option<Arc<RefreshNotifier>>,
    batcher: Arc<EventBatcher>,
    monitor: MonitorLoop,
}

impl SyncService {
    /// Validate `config`, open the snapshot database and build the pipeline.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, an unreachable database, or an enabled
    /// media server integration without a client.
    pub async fn open(config: CoreConfig, deps: CoreDependencies) -> Result<Self> {
        config.validate()?;

        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    CoreError::InitializationFailed(format!(
                        "cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let pool = create_pool(DatabaseConfig::new(&config.database_path)).await?;
        let store = Arc::new(SqliteSnapshotStore::new(pool));
        store.initialize().await?;

        let event_bus = EventBus::default();

        let (refresher, notifier): (Arc<dyn PathRefresher>, Option<Arc<RefreshNotifier>>) =
            if config.media.enabled {
                let client = deps.media_client.ok_or_else(|| CoreError::CapabilityMissing {
                    capability: "media_server".to_string(),
                    message: "media server integration is enabled but no client was provided"
                        .to_string(),
                })?;
                let notifier = Arc::new(RefreshNotifier::new(
                    client,
                    PathMapping::new(&config.media.path_mapping),
                ));
                (notifier.clone(), Some(notifier))
            } else {
                info!("Media server integration disabled");
                (Arc::new(DisabledRefresher), None)
            };

        let projector = Arc::new(SymlinkProjector::new(&config.symlink, deps.clock.clone()));
        let scanner = Arc::new(Scanner::new(
            deps.lister.clone(),
            store.clone(),
            deps.clock.clone(),
        ));
        let batcher = Arc::new(
            EventBatcher::new(&config.batch, projector.clone(), refresher.clone())
                .with_event_bus(event_bus.clone()),
        );
        let monitor = MonitorLoop::new(
            config.monitor.clone(),
            deps.lister,
            scanner.clone(),
            batcher.clone(),
        )
        .with_event_bus(event_bus.clone());

        info!(
            source = %config.symlink.source_dir.display(),
            target = %config.symlink.target_dir.display(),
            "Sync service ready"
        );

        Ok(Self {
            config,
            event_bus,
            store,
            scanner,
            projector,
            refresher,
            notifier,
            batcher,
            monitor,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.event_bus.subscribe()
    }

    /// Load existing links and start the monitor loop.
    pub async fn start(&self) -> Result<()> {
        let loaded = self.projector.load().await?;
        info!(links = loaded, "Loaded existing links");
        self.monitor.start().await?;
        Ok(())
    }

    /// Stop the monitor loop. The batcher keeps draining queued events.
    pub async fn stop(&self) {
        self.monitor.stop().await;
    }

    /// Stop everything. The service cannot be restarted afterwards.
    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        self.batcher.shutdown().await;
        info!("Sync service shut down");
    }

    pub async fn is_running(&self) -> bool {
        self.monitor.is_running().await
    }

    /// Run one scan outside the schedule and queue its events.
    pub async fn scan_now(&self) -> Result<ChangeCounts> {
        let events = self.scanner.scan(&self.config.monitor.scan_root).await?;
        let counts = ChangeCounts::of(&events);
        self.batcher.submit(events).await?;
        Ok(counts)
    }

    /// Clear every link and recreate one per file in the snapshot, then ask
    /// the media server to refresh the affected libraries.
    pub async fn rebuild_links(&self) -> Result<LinkReport> {
        let paths: Vec<String> = self
            .store
            .list_files()
            .await?
            .into_iter()
            .map(|record| record.path)
            .collect();

        let report = self.projector.rebuild(&paths).await?;
        self.event_bus
            .emit(CoreEvent::Links(LinkEvent::Rebuilt {
                valid: report.valid,
                invalid: report.invalid,
                missing: report.missing,
            }))
            .ok();

        let targets: Vec<PathBuf> = paths
            .iter()
            .filter_map(|path| self.projector.target_path(path).ok())
            .collect();
        if let Err(e) = self.refresher.refresh_paths(&targets).await {
            warn!(error = %e, "Refresh after rebuild failed");
        }

        Ok(report)
    }

    pub async fn verify_links(&self) -> Result<LinkReport> {
        Ok(self.projector.verify().await?)
    }

    pub async fn links(&self) -> Vec<SymlinkEntry> {
        self.projector.get_all().await
    }

    pub async fn refresh_paths(&self, paths: &[PathBuf]) -> Result<RefreshSummary> {
        Ok(self.refresher.refresh_paths(paths).await?)
    }

    /// Delete backups older than the configured retention.
    pub async fn cleanup_backups(&self) -> Result<usize> {
        let removed = self
            .projector
            .cleanup_backups(self.config.symlink.backup_retention())
            .await?;
        self.event_bus
            .emit(CoreEvent::Links(LinkEvent::BackupsCleaned {
                removed: removed as u64,
            }))
            .ok();
        Ok(removed)
    }

    pub async fn status(&self) -> Result<ServiceStatus> {
        let media = match &self.notifier {
            Some(notifier) => Some(notifier.stats().await),
            None => None,
        };

        Ok(ServiceStatus {
            monitor: self.monitor.stats().await,
            scanner: self.scanner.stats().await,
            batcher: self.batcher.stats().await,
            links: self.projector.stats().await,
            media,
            snapshot_records: self.store.count().await?,
        })
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
