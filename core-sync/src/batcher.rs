//! # Event Batcher
//!
//! Buffers change events from the scanner, applies them to the link tree in
//! batches and asks the media server to refresh what changed.
//!
//! ## Overview
//!
//! A batch closes when it holds `batch_size` events or `batch_interval` has
//! passed since its first event arrived. Within a batch events are grouped by
//! kind and handled deletions first, then additions, then modifications;
//! order inside a group is arrival order. One event failing never stops the
//! rest of its batch.
//!
//! After every filesystem operation of a batch has finished, the absolute
//! target paths that actually changed are handed to the [`PathRefresher`] in a
//! single call.
//!
//! The worker task starts with the first submission and runs until
//! [`EventBatcher::shutdown`]. Events still queued at shutdown are dropped;
//! a later link rebuild restores the tree from the snapshot.

use chrono::{DateTime, Utc};
use core_links::LinkProjection;
use core_media::PathRefresher;
use core_runtime::config::BatchSettings;
use core_runtime::events::{BatchEvent, CoreEvent, EventBus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::models::{ChangeEvent, ChangeKind};

/// Order in which the groups of a batch are applied.
const GROUP_ORDER: [ChangeKind; 3] = [ChangeKind::Deleted, ChangeKind::Added, ChangeKind::Modified];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatcherStats {
    /// Events accepted by `submit`
    pub total_events: u64,
    pub processed_events: u64,
    pub failed_events: u64,
    pub batches_dispatched: u64,
    /// Events waiting in the queue
    pub pending_events: u64,
    pub last_batch_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// processed / (processed + failed) as a percentage, 100 when idle
    pub success_rate: f64,
}

struct BatcherShared {
    batch_size: usize,
    batch_interval: Duration,
    projector: Arc<dyn LinkProjection>,
    refresher: Arc<dyn PathRefresher>,
    event_bus: Option<EventBus>,
    stats: Mutex<BatcherStats>,
}

pub struct EventBatcher {
    shared: Arc<BatcherShared>,
    sender: mpsc::Sender<ChangeEvent>,
    receiver: Mutex<Option<mpsc::Receiver<ChangeEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl EventBatcher {
    pub fn new(
        settings: &BatchSettings,
        projector: Arc<dyn LinkProjection>,
        refresher: Arc<dyn PathRefresher>,
    ) -> Self {
        let capacity = settings.queue_capacity.max(settings.batch_size).max(1);
        let (sender, receiver) = mpsc::channel(capacity);

        Self {
            shared: Arc::new(BatcherShared {
                batch_size: settings.batch_size.max(1),
                batch_interval: settings.batch_interval(),
                projector,
                refresher,
                event_bus: None,
                stats: Mutex::new(BatcherStats::default()),
            }),
            sender,
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Publish batch progress on `event_bus`. Call before the first submit.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.event_bus = Some(event_bus);
        }
        self
    }

    /// Queue `events` for the next batches, starting the worker if needed.
    ///
    /// Waits only for queue space, never for processing.
    ///
    /// # Errors
    ///
    /// [`SyncError::Cancelled`] after shutdown, [`SyncError::QueueClosed`] if
    /// the worker exited unexpectedly.
    pub async fn submit(&self, events: Vec<ChangeEvent>) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if events.is_empty() {
            return Ok(());
        }

        self.ensure_started().await;

        let count = events.len();
        debug!(count, "Queueing change events");

        for (queued, event) in events.into_iter().enumerate() {
            if self.sender.send(event).await.is_err() {
                warn!(queued, dropped = count - queued, "Batch queue closed while submitting");
                return Err(SyncError::QueueClosed);
            }
            self.shared.stats.lock().await.total_events += 1;
        }
        Ok(())
    }

    pub async fn stats(&self) -> BatcherStats {
        let mut stats = self.shared.stats.lock().await.clone();
        stats.pending_events = (self.sender.max_capacity() - self.sender.capacity()) as u64;
        let attempted = stats.processed_events + stats.failed_events;
        stats.success_rate = if attempted == 0 {
            100.0
        } else {
            stats.processed_events as f64 / attempted as f64 * 100.0
        };
        stats
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop the worker and wait for it to exit. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Batch worker ended abnormally");
            }
            let pending = self.sender.max_capacity() - self.sender.capacity();
            if pending > 0 {
                warn!(pending, "Dropped queued change events at shutdown");
            }
            info!("Event batcher stopped");
        }
    }

    async fn ensure_started(&self) {
        let Some(receiver) = self.receiver.lock().await.take() else {
            return;
        };

        let worker = BatchWorker {
            shared: self.shared.clone(),
            receiver,
            cancellation_token: self.cancellation_token.clone(),
        };
        *self.worker.lock().await = Some(tokio::spawn(worker.run()));
        info!("Event batcher started");
    }
}

impl std::fmt::Debug for EventBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBatcher")
            .field("batch_size", &self.shared.batch_size)
            .field("batch_interval", &self.shared.batch_interval)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Default)]
struct GroupOutcome {
    processed: u64,
    failed: u64,
    last_error: Option<String>,
}

struct BatchWorker {
    shared: Arc<BatcherShared>,
    receiver: mpsc::Receiver<ChangeEvent>,
    cancellation_token: CancellationToken,
}

impl BatchWorker {
    async fn run(mut self) {
        let cancellation_token = self.cancellation_token.clone();
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                batch = self.collect() => batch,
            };

            match batch {
                Some(batch) => self.shared.dispatch(batch).await,
                None => break,
            }
        }
        debug!("Batch worker exiting");
    }

    /// Wait for a first event, then gather more until the batch is full or
    /// the interval has passed. `None` once the channel is closed and empty.
    async fn collect(&mut self) -> Option<Vec<ChangeEvent>> {
        let first = self.receiver.recv().await?;
        let deadline = Instant::now() + self.shared.batch_interval;

        let mut batch = Vec::with_capacity(self.shared.batch_size);
        batch.push(first);
        while batch.len() < self.shared.batch_size {
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(event)) => batch.push(event),
                Ok(None) | Err(_) => break,
            }
        }
        Some(batch)
    }
}

impl BatcherShared {
    #[instrument(skip(self, batch), fields(events = batch.len()))]
    async fn dispatch(&self, batch: Vec<ChangeEvent>) {
        let batch_id = Uuid::new_v4().to_string();
        let total = batch.len() as u64;

        let mut changed_paths = Vec::new();
        let mut processed = 0;
        let mut failed = 0;
        let mut last_error = None;

        for kind in GROUP_ORDER {
            let group: Vec<&ChangeEvent> = batch.iter().filter(|e| e.kind == kind).collect();
            if group.is_empty() {
                continue;
            }

            let outcome = self.apply_group(kind, &group, &mut changed_paths).await;
            if outcome.failed > 0 {
                warn!(kind = %kind, failed = outcome.failed, "Some events in group failed");
            }
            processed += outcome.processed;
            failed += outcome.failed;
            if outcome.last_error.is_some() {
                last_error = outcome.last_error;
            }
        }

        let changed = changed_paths.len() as u64;
        info!(batch_id = %batch_id, total, processed, failed, changed, "Batch applied");

        {
            let mut stats = self.stats.lock().await;
            stats.processed_events += processed;
            stats.failed_events += failed;
            if last_error.is_some() {
                stats.last_error = last_error;
            }
        }

        self.emit(BatchEvent::Dispatched {
            batch_id: batch_id.clone(),
            events: total,
            processed,
            failed,
            changed_paths: changed,
        });

        if !changed_paths.is_empty() {
            self.refresh(&batch_id, &changed_paths).await;
        }

        let mut stats = self.stats.lock().await;
        stats.batches_dispatched += 1;
        stats.last_batch_at = Some(Utc::now());
    }

    async fn apply_group(
        &self,
        kind: ChangeKind,
        group: &[&ChangeEvent],
        changed_paths: &mut Vec<PathBuf>,
    ) -> GroupOutcome {
        let mut outcome = GroupOutcome::default();

        for event in group {
            let path = event.path();
            // Directories only exist implicitly in the link tree
            if event.record.is_directory {
                outcome.processed += 1;
                continue;
            }

            let result = match kind {
                ChangeKind::Deleted => self.projector.remove(path).await.map(|removed| {
                    if !removed {
                        debug!(path = %path, "No link to remove");
                    }
                    removed
                }),
                ChangeKind::Added => match self.projector.create(path).await {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        outcome.failed += 1;
                        outcome.last_error = Some(format!("source missing: {}", path));
                        continue;
                    }
                    Err(e) => Err(e),
                },
                // Content changed behind an existing link
                ChangeKind::Modified => Ok(true),
            };

            match result {
                Ok(changed) => {
                    outcome.processed += 1;
                    if changed {
                        match self.projector.target_path(path) {
                            Ok(target) => changed_paths.push(target),
                            Err(e) => warn!(path = %path, error = %e, "Cannot resolve link path"),
                        }
                    }
                }
                Err(e) => {
                    warn!(kind = %kind, path = %path, error = %e, "Change event failed");
                    outcome.failed += 1;
                    outcome.last_error = Some(e.to_string());
                }
            }
        }

        outcome
    }

    async fn refresh(&self, batch_id: &str, paths: &[PathBuf]) {
        match self.refresher.refresh_paths(paths).await {
            Ok(summary) => {
                if !summary.processed.is_empty() {
                    info!(
                        batch_id = %batch_id,
                        success = summary.success,
                        failed = summary.failed,
                        "Media server refresh requested"
                    );
                    self.emit(BatchEvent::RefreshCompleted {
                        batch_id: batch_id.to_string(),
                        success: summary.success,
                        failed: summary.failed,
                        libraries: summary.processed,
                    });
                }
            }
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "Media server refresh failed");
                self.stats.lock().await.last_error = Some(e.to_string());
                self.emit(BatchEvent::RefreshFailed {
                    batch_id: batch_id.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Batch(event)).ok();
        }
    }
}
