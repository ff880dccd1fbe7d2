//! # Change Detection & Dispatch
//!
//! Watches a remote store for changes and turns them into link updates and
//! media server refreshes.
//!
//! ## Overview
//!
//! This crate owns the pipeline between the remote listing and the link tree:
//! - Polling the remote store on a schedule with retry and backoff
//! - Diffing each listing against a persistent snapshot
//! - Batching the resulting change events
//! - Applying batches through the link projector and refreshing the server
//!
//! ## Components
//!
//! - **Models** (`models`): Snapshot records, change events and path rules
//! - **Database** (`db`): SQLite connection pool setup
//! - **Repository** (`repository`): Transactional snapshot persistence
//! - **Scanner** (`scanner`): Listing-vs-snapshot diff inside one transaction
//! - **Batcher** (`batcher`): Count-or-timeout batching and dispatch
//! - **Monitor** (`monitor`): Scan scheduling, retries and shutdown

pub mod batcher;
pub mod db;
pub mod error;
pub mod models;
pub mod monitor;
pub mod repository;
pub mod scanner;

pub use batcher::{BatcherStats, EventBatcher};
pub use db::{create_pool, create_test_pool, DatabaseConfig};
pub use error::{Result, SyncError};
pub use models::{normalize_path, ChangeCounts, ChangeEvent, ChangeKind, FileRecord};
pub use monitor::{MonitorLoop, MonitorState, MonitorStats};
pub use repository::{SnapshotStore, SnapshotTransaction, SqliteSnapshotStore};
pub use scanner::{Scanner, ScannerStats};
