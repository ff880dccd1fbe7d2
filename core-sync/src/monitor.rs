//! # Monitor Loop
//!
//! Drives periodic scans of the remote store and feeds their change events to
//! the [`EventBatcher`].
//!
//! ## Lifecycle
//!
//! ```text
//! Stopped --start()--> Scanning --ok--> Waiting(scan_interval) --> Scanning
//!                         |
//!                         +--err--> Waiting(retry_delay * n) --> Scanning
//!                         |
//!                         +--auth error or n == max_retries--> Stopped
//! ```
//!
//! `stop()` cancels the wait or the remote listing. Once a listing has been
//! diffed and committed, its events are handed to the batcher before the
//! loop exits, even if that means waiting for queue space. Expired snapshot records are swept after a successful scan
//! at most once per `sweep_interval`.

use bridge_traits::remote::RemoteLister;
use chrono::{DateTime, Utc};
use core_runtime::config::MonitorSettings;
use core_runtime::events::{CoreEvent, EventBus, MonitorEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::batcher::EventBatcher;
use crate::error::{Result, SyncError};
use crate::models::ChangeCounts;
use crate::scanner::Scanner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Stopped,
    Scanning,
    Waiting,
}

impl MonitorState {
    pub fn is_running(&self) -> bool {
        !matches!(self, MonitorState::Stopped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub state: MonitorState,
    pub total_scans: u64,
    pub failed_scans: u64,
    /// Successful scans as a percentage of all scans, 0 before the first
    pub success_rate: f64,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Consecutive failures since the last successful scan
    pub retry_count: u32,
    /// Why the loop last stopped
    pub stop_reason: Option<String>,
}

impl Default for MonitorStats {
    fn default() -> Self {
        Self {
            state: MonitorState::Stopped,
            total_scans: 0,
            failed_scans: 0,
            success_rate: 0.0,
            last_scan_at: None,
            last_error: None,
            retry_count: 0,
            stop_reason: None,
        }
    }
}

struct ActiveLoop {
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct MonitorLoop {
    settings: MonitorSettings,
    lister: Arc<dyn RemoteLister>,
    scanner: Arc<Scanner>,
    batcher: Arc<EventBatcher>,
    event_bus: Option<EventBus>,
    stats: Arc<Mutex<MonitorStats>>,
    active: Mutex<Option<ActiveLoop>>,
}

impl MonitorLoop {
    pub fn new(
        settings: MonitorSettings,
        lister: Arc<dyn RemoteLister>,
        scanner: Arc<Scanner>,
        batcher: Arc<EventBatcher>,
    ) -> Self {
        Self {
            settings,
            lister,
            scanner,
            batcher,
            event_bus: None,
            stats: Arc::new(Mutex::new(MonitorStats::default())),
            active: Mutex::new(None),
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Authenticate and launch the loop. A no-op while already running.
    ///
    /// # Errors
    ///
    /// Returns the authentication failure; the loop is not started.
    pub async fn start(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.take() {
            if !current.handle.is_finished() && self.stats.lock().await.state.is_running() {
                warn!("Monitor already running, ignoring start");
                *active = Some(current);
                return Ok(());
            }
            // The previous loop stopped itself; reap it before relaunching
            if let Err(e) = current.handle.await {
                warn!(error = %e, "Previous monitor task ended abnormally");
            }
        }

        if let Err(e) = self.lister.authenticate().await {
            error!(error = %e, "Remote authentication failed, monitor not started");
            let mut stats = self.stats.lock().await;
            stats.last_error = Some(e.to_string());
            stats.stop_reason = Some("authentication failed".to_string());
            return Err(SyncError::Remote(e));
        }

        {
            let mut stats = self.stats.lock().await;
            stats.state = MonitorState::Scanning;
            stats.retry_count = 0;
            stats.stop_reason = None;
        }

        let cancellation_token = CancellationToken::new();
        let worker = MonitorWorker {
            settings: self.settings.clone(),
            scanner: self.scanner.clone(),
            batcher: self.batcher.clone(),
            event_bus: self.event_bus.clone(),
            stats: self.stats.clone(),
            cancellation_token: cancellation_token.clone(),
        };

        info!(
            scan_root = %self.settings.scan_root,
            interval_ms = self.settings.scan_interval_ms,
            "Monitor started"
        );
        worker.emit(MonitorEvent::Started {
            scan_root: self.settings.scan_root.clone(),
        });

        *active = Some(ActiveLoop {
            cancellation_token,
            handle: tokio::spawn(worker.run()),
        });
        Ok(())
    }

    /// Cancel the loop and wait until it has exited. Safe to call repeatedly.
    pub async fn stop(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };

        active.cancellation_token.cancel();
        if let Err(e) = active.handle.await {
            warn!(error = %e, "Monitor task ended abnormally");
            self.stats.lock().await.state = MonitorState::Stopped;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.stats.lock().await.state.is_running()
    }

    pub async fn stats(&self) -> MonitorStats {
        self.stats.lock().await.clone()
    }
}

impl std::fmt::Debug for MonitorLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorLoop")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Worker
// ============================================================================

struct MonitorWorker {
    settings: MonitorSettings,
    scanner: Arc<Scanner>,
    batcher: Arc<EventBatcher>,
    event_bus: Option<EventBus>,
    stats: Arc<Mutex<MonitorStats>>,
    cancellation_token: CancellationToken,
}

impl MonitorWorker {
    async fn run(self) {
        let mut last_sweep: Option<Instant> = None;

        let reason = loop {
            self.set_state(MonitorState::Scanning).await;

            match self.scan_once().await {
                Err(SyncError::Cancelled) if self.cancellation_token.is_cancelled() => {
                    break "stop requested".to_string();
                }
                Ok(()) => {
                    if last_sweep.map_or(true, |at| at.elapsed() >= self.settings.sweep_interval()) {
                        self.sweep().await;
                        last_sweep = Some(Instant::now());
                    }

                    self.set_state(MonitorState::Waiting).await;
                    if !self.sleep(self.settings.scan_interval()).await {
                        break "stop requested".to_string();
                    }
                }
                Err(e) => {
                    let retry_count = self.record_failure(&e).await;
                    let will_retry = !e.is_auth() && retry_count < self.settings.max_retries;

                    self.emit(MonitorEvent::ScanFailed {
                        message: e.to_string(),
                        retry_count,
                        will_retry,
                    });

                    if e.is_auth() {
                        error!(error = %e, "Remote rejected credentials, stopping monitor");
                        break format!("authentication failed: {}", e);
                    }
                    if !will_retry {
                        error!(error = %e, retry_count, "Scan failed too many times, stopping monitor");
                        break format!("giving up after {} failed scans: {}", retry_count, e);
                    }

                    let delay = self.settings.retry_delay() * retry_count;
                    warn!(error = %e, retry_count, delay_ms = delay.as_millis() as u64, "Scan failed, retrying");
                    self.set_state(MonitorState::Waiting).await;
                    if !self.sleep(delay).await {
                        break "stop requested".to_string();
                    }
                }
            }
        };

        {
            let mut stats = self.stats.lock().await;
            stats.state = MonitorState::Stopped;
            stats.stop_reason = Some(reason.clone());
        }
        info!(reason = %reason, "Monitor stopped");
        self.emit(MonitorEvent::Stopped { reason });
    }

    async fn scan_once(&self) -> Result<()> {
        let started = Instant::now();
        let events = self
            .scanner
            .scan_until_cancelled(&self.settings.scan_root, &self.cancellation_token)
            .await?;
        let counts = ChangeCounts::of(&events);

        // The snapshot is committed; these events must reach the batcher even
        // if a stop arrives meanwhile
        if let Err(e) = self.batcher.submit(events).await {
            error!(error = %e, pending = counts.total(), "Committed changes were not queued");
            return Err(e);
        }

        {
            let mut stats = self.stats.lock().await;
            stats.total_scans += 1;
            stats.retry_count = 0;
            stats.last_scan_at = Some(Utc::now());
            stats.success_rate = success_rate(&stats);
        }

        self.emit(MonitorEvent::ScanCompleted {
            scan_id: Uuid::new_v4().to_string(),
            added: counts.added,
            modified: counts.modified,
            deleted: counts.deleted,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(())
    }

    async fn sweep(&self) {
        match self.scanner.sweep_expired(self.settings.retention()).await {
            Ok(0) => {}
            Ok(removed) => self.emit(MonitorEvent::RecordsSwept { removed }),
            Err(e) => warn!(error = %e, "Snapshot retention sweep failed"),
        }
    }

    async fn record_failure(&self, e: &SyncError) -> u32 {
        let mut stats = self.stats.lock().await;
        stats.total_scans += 1;
        stats.failed_scans += 1;
        stats.retry_count += 1;
        stats.last_error = Some(e.to_string());
        stats.success_rate = success_rate(&stats);
        stats.retry_count
    }

    async fn set_state(&self, state: MonitorState) {
        self.stats.lock().await.state = state;
    }

    /// Returns false if cancelled before `duration` elapsed.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancellation_token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn emit(&self, event: MonitorEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Monitor(event)).ok();
        }
    }
}

fn success_rate(stats: &MonitorStats) -> f64 {
    if stats.total_scans == 0 {
        0.0
    } else {
        (stats.total_scans - stats.failed_scans) as f64 / stats.total_scans as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::repository::SqliteSnapshotStore;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::remote::RemoteEntry;
    use bridge_traits::time::SystemClock;
    use core_links::{LinkProjection, Result as LinkResult};
    use core_media::DisabledRefresher;
    use core_runtime::config::BatchSettings;
    use mockall::mock;
    use std::path::PathBuf;

    mock! {
        Lister {}

        #[async_trait]
        impl RemoteLister for Lister {
            async fn authenticate(&self) -> BridgeResult<()>;
            async fn list(&self, root: &str) -> BridgeResult<Vec<RemoteEntry>>;
        }
    }

    struct NoopProjector;

    #[async_trait]
    impl LinkProjection for NoopProjector {
        fn target_path(&self, relative_path: &str) -> LinkResult<PathBuf> {
            Ok(PathBuf::from("/links").join(relative_path))
        }

        async fn create(&self, _relative_path: &str) -> LinkResult<bool> {
            Ok(true)
        }

        async fn remove(&self, _relative_path: &str) -> LinkResult<bool> {
            Ok(true)
        }
    }

    fn settings(max_retries: u32) -> MonitorSettings {
        MonitorSettings {
            scan_root: "movies".to_string(),
            scan_interval_ms: 60_000,
            max_retries,
            retry_delay_ms: 10,
            ..Default::default()
        }
    }

    async fn monitor(lister: MockLister, settings: MonitorSettings) -> MonitorLoop {
        let lister: Arc<dyn RemoteLister> = Arc::new(lister);
        let store = Arc::new(SqliteSnapshotStore::new(create_test_pool().await.unwrap()));
        store.initialize().await.unwrap();

        let scanner = Arc::new(Scanner::new(lister.clone(), store, Arc::new(SystemClock)));
        let batcher = Arc::new(EventBatcher::new(
            &BatchSettings::default(),
            Arc::new(NoopProjector),
            Arc::new(DisabledRefresher),
        ));
        MonitorLoop::new(settings, lister, scanner, batcher)
    }

    /// Takes `delay` per link creation.
    struct SlowProjector {
        delay: Duration,
    }

    #[async_trait]
    impl LinkProjection for SlowProjector {
        fn target_path(&self, relative_path: &str) -> LinkResult<PathBuf> {
            Ok(PathBuf::from("/links").join(relative_path))
        }

        async fn create(&self, _relative_path: &str) -> LinkResult<bool> {
            tokio::time::sleep(self.delay).await;
            Ok(true)
        }

        async fn remove(&self, _relative_path: &str) -> LinkResult<bool> {
            Ok(true)
        }
    }

    async fn wait_until_stopped(monitor: &MonitorLoop) -> MonitorStats {
        for _ in 0..200 {
            let stats = monitor.stats().await;
            if stats.state == MonitorState::Stopped {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("monitor did not stop in time");
    }

    #[tokio::test]
    async fn test_auth_failure_prevents_start() {
        let mut lister = MockLister::new();
        lister
            .expect_authenticate()
            .returning(|| Err(BridgeError::Auth("bad token".into())));
        lister.expect_list().never();

        let monitor = monitor(lister, settings(3)).await;
        let result = monitor.start().await;
        assert!(matches!(result, Err(ref e) if e.is_auth()));
        assert!(!monitor.is_running().await);
    }

    #[tokio::test]
    async fn test_scan_then_wait_then_stop() {
        let mut lister = MockLister::new();
        lister.expect_authenticate().returning(|| Ok(()));
        lister.expect_list().returning(|_| {
            Ok(vec![RemoteEntry::file("f1", "movies/a.mkv", Utc::now(), 1)])
        });

        let monitor = monitor(lister, settings(3)).await;
        let bus = EventBus::new(16);
        let monitor = monitor.with_event_bus(bus.clone());
        let mut events = bus.subscribe();

        monitor.start().await.unwrap();
        // Second start is ignored while running
        monitor.start().await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            CoreEvent::Monitor(MonitorEvent::Started { .. })
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            CoreEvent::Monitor(MonitorEvent::ScanCompleted { added: 1, .. })
        ));

        let stats = monitor.stats().await;
        assert_eq!(stats.total_scans, 1);
        assert!(stats.state.is_running());

        monitor.stop().await;
        monitor.stop().await;
        let stats = monitor.stats().await;
        assert_eq!(stats.state, MonitorState::Stopped);
        assert_eq!(stats.stop_reason.as_deref(), Some("stop requested"));
        assert_eq!(stats.success_rate, 100.0);
    }

    #[tokio::test]
    async fn test_transient_failures_stop_after_max_retries() {
        let mut lister = MockLister::new();
        lister.expect_authenticate().returning(|| Ok(()));
        lister
            .expect_list()
            .times(3)
            .returning(|_| Err(BridgeError::Transient("timeout".into())));

        let monitor = monitor(lister, settings(3)).await;
        monitor.start().await.unwrap();

        let stats = wait_until_stopped(&monitor).await;
        assert_eq!(stats.failed_scans, 3);
        assert_eq!(stats.retry_count, 3);
        assert!(stats.stop_reason.unwrap().starts_with("giving up"));
        assert!(stats.last_error.is_some());
    }

    #[tokio::test]
    async fn test_auth_failure_during_scan_stops_immediately() {
        let mut lister = MockLister::new();
        lister.expect_authenticate().returning(|| Ok(()));
        lister
            .expect_list()
            .times(1)
            .returning(|_| Err(BridgeError::Auth("revoked".into())));

        let monitor = monitor(lister, settings(5)).await;
        monitor.start().await.unwrap();

        let stats = wait_until_stopped(&monitor).await;
        assert_eq!(stats.failed_scans, 1);
        assert!(stats.stop_reason.unwrap().starts_with("authentication failed"));
    }

    #[tokio::test]
    async fn test_restart_after_self_stop() {
        let mut lister = MockLister::new();
        lister.expect_authenticate().times(2).returning(|| Ok(()));
        lister
            .expect_list()
            .returning(|_| Err(BridgeError::Auth("revoked".into())));

        let monitor = monitor(lister, settings(1)).await;
        monitor.start().await.unwrap();
        wait_until_stopped(&monitor).await;

        monitor.start().await.unwrap();
        let stats = wait_until_stopped(&monitor).await;
        assert_eq!(stats.failed_scans, 2);
    }

    #[tokio::test]
    async fn test_stop_during_submit_keeps_committed_events() {
        let listed_at = Utc::now();
        let mut lister = MockLister::new();
        lister.expect_authenticate().returning(|| Ok(()));
        lister.expect_list().returning(move |_| {
            Ok((0..6)
                .map(|i| {
                    RemoteEntry::file(
                        format!("f{}", i),
                        format!("movies/{}.mkv", i),
                        listed_at,
                        1,
                    )
                })
                .collect())
        });
        let lister: Arc<dyn RemoteLister> = Arc::new(lister);

        let store = Arc::new(SqliteSnapshotStore::new(create_test_pool().await.unwrap()));
        store.initialize().await.unwrap();
        let scanner = Arc::new(Scanner::new(lister.clone(), store, Arc::new(SystemClock)));
        let batcher = Arc::new(EventBatcher::new(
            &BatchSettings {
                batch_size: 1,
                batch_interval_ms: 10,
                queue_capacity: 1,
            },
            Arc::new(SlowProjector {
                delay: Duration::from_millis(100),
            }),
            Arc::new(DisabledRefresher),
        ));
        let monitor = MonitorLoop::new(settings(3), lister, scanner.clone(), batcher.clone());

        monitor.start().await.unwrap();
        // The queue holds one event, so the scan is still submitting here
        tokio::time::sleep(Duration::from_millis(150)).await;
        monitor.stop().await;

        assert_eq!(batcher.stats().await.total_events, 6);
        let stats = monitor.stats().await;
        assert_eq!(stats.total_scans, 1);
        assert_eq!(stats.stop_reason.as_deref(), Some("stop requested"));

        // Nothing is left for a later scan to rediscover
        assert!(scanner.scan("movies").await.unwrap().is_empty());
        batcher.shutdown().await;
    }
}
