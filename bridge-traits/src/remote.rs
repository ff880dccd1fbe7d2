//! Remote Storage Listing
//!
//! Contract for the cloud-storage client that reports what currently exists
//! under a remote root. The client owns the wire protocol and credentials;
//! the core only sees flat [`RemoteEntry`] values.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Kind of a remote entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// A file or directory as reported by the provider's listing API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Provider-assigned stable identity
    pub id: String,
    /// Path relative to the remote store root, forward-slash separated
    pub path: String,
    pub kind: EntryKind,
    pub modified_time: DateTime<Utc>,
    /// Size in bytes, 0 for directories
    pub size: u64,
    pub mime_type: Option<String>,
}

impl RemoteEntry {
    pub fn file(
        id: impl Into<String>,
        path: impl Into<String>,
        modified_time: DateTime<Utc>,
        size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            kind: EntryKind::File,
            modified_time,
            size,
            mime_type: None,
        }
    }

    pub fn directory(
        id: impl Into<String>,
        path: impl Into<String>,
        modified_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            kind: EntryKind::Directory,
            modified_time,
            size: 0,
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Remote listing trait
///
/// Implementations wrap a storage provider (Google Drive polling query,
/// Activity API diff, ...). They must report every entry beneath `root`
/// recursively, with paths relative to the store root rather than to `root`.
///
/// Errors should be classified: network and timeout failures as
/// [`BridgeError::Transient`](crate::error::BridgeError::Transient), rejected
/// credentials as [`BridgeError::Auth`](crate::error::BridgeError::Auth).
///
/// # Example
///
/// ```ignore
/// use bridge_traits::remote::RemoteLister;
///
/// async fn count_files(lister: &dyn RemoteLister) -> Result<usize> {
///     let entries = lister.list("movies").await?;
///     Ok(entries.iter().filter(|e| !e.is_directory()).count())
/// }
/// ```
#[async_trait]
pub trait RemoteLister: Send + Sync {
    /// Establish or refresh credentials before the first listing.
    ///
    /// Providers without an explicit login step can rely on the default.
    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    /// List every entry under `root`. An empty root means the whole store.
    async fn list(&self, root: &str) -> Result<Vec<RemoteEntry>>;
}
