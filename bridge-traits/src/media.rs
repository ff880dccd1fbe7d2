//! Media Server Client
//!
//! Contract for the downstream media server whose libraries are refreshed
//! after link changes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A library root as configured on the media server
///
/// A library with several folders is reported as several roots sharing
/// the same `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRoot {
    pub id: String,
    pub name: String,
    /// Server-side mount location of the library folder
    pub mount_path: String,
}

impl LibraryRoot {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        mount_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mount_path: mount_path.into(),
        }
    }
}

/// Media server trait
///
/// Implementations wrap the server's HTTP API (Emby, Jellyfin, ...).
/// Refresh calls must be idempotent on the server side since callers do
/// not wait for them during shutdown.
#[async_trait]
pub trait MediaServerClient: Send + Sync {
    /// Fetch every configured library root with its mount location.
    async fn library_roots(&self) -> Result<Vec<LibraryRoot>>;

    /// Ask the server to rescan one library. Returns whether the server
    /// accepted the request.
    async fn refresh_library(&self, library_id: &str) -> Result<bool>;
}
