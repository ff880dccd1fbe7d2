//! # Host Bridge Traits
//!
//! Collaborator contracts consumed by the sync core.
//!
//! ## Overview
//!
//! The core mirrors a remote file store into local symlinks and keeps a media
//! server's library in sync. It never talks to the storage provider or the
//! media server directly; instead each host wires concrete adapters for the
//! traits defined here.
//!
//! ## Traits
//!
//! - [`RemoteLister`](remote::RemoteLister) - Lists remote entries under a root
//! - [`MediaServerClient`](media::MediaServerClient) - Library roots and refresh calls
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. Adapters
//! should:
//!
//! - Map network and timeout failures to `BridgeError::Transient`
//! - Map rejected or expired credentials to `BridgeError::Auth`
//! - Provide actionable error messages
//!
//! The monitor loop retries transient failures with backoff and stops on
//! authentication failures.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent usage
//! across async tasks.

pub mod error;
pub mod media;
pub mod remote;
pub mod time;

pub use error::{BridgeError, Result};
pub use media::{LibraryRoot, MediaServerClient};
pub use remote::{EntryKind, RemoteEntry, RemoteLister};
pub use time::{Clock, ManualClock, SystemClock};
