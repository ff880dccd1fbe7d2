//! # Refresh Notifier
//!
//! Turns a set of changed local paths into the smallest set of library
//! refresh calls on the media server.
//!
//! For every path the notifier takes the parent directory, rewrites it with
//! the configured path mapping and picks the library whose mount location is
//! the longest component-wise prefix of the result. Each library is refreshed
//! at most once per call. Paths outside every library are skipped silently.

use async_trait::async_trait;
use bridge_traits::media::{LibraryRoot, MediaServerClient};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{MediaError, Result};
use crate::path_mapping::{is_component_prefix, normalize, PathMapping};

/// Outcome of one `refresh_paths` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummary {
    /// Refresh calls the server accepted
    pub success: u64,
    /// Refresh calls that were rejected or errored
    pub failed: u64,
    /// Library ids a refresh was issued for, in call order
    pub processed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierStats {
    pub calls: u64,
    pub refreshes_succeeded: u64,
    pub refreshes_failed: u64,
    pub unmatched_paths: u64,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Downstream refresh seam used by the event batcher.
#[async_trait]
pub trait PathRefresher: Send + Sync {
    async fn refresh_paths(&self, paths: &[PathBuf]) -> Result<RefreshSummary>;
}

pub struct RefreshNotifier {
    client: Arc<dyn MediaServerClient>,
    mapping: PathMapping,
    stats: Mutex<NotifierStats>,
}

impl RefreshNotifier {
    pub fn new(client: Arc<dyn MediaServerClient>, mapping: PathMapping) -> Self {
        Self {
            client,
            mapping,
            stats: Mutex::new(NotifierStats::default()),
        }
    }

    pub async fn stats(&self) -> NotifierStats {
        self.stats.lock().await.clone()
    }

    fn match_library<'a>(
        &self,
        libraries: &'a [(String, LibraryRoot)],
        path: &Path,
    ) -> Option<&'a LibraryRoot> {
        let parent = path.parent().unwrap_or(path);
        let remapped = self.mapping.apply(&parent.to_string_lossy());
        libraries
            .iter()
            .find(|(mount, _)| is_component_prefix(mount, &remapped))
            .map(|(_, library)| library)
    }
}

#[async_trait]
impl PathRefresher for RefreshNotifier {
    #[instrument(skip(self, paths), fields(paths = paths.len()))]
    async fn refresh_paths(&self, paths: &[PathBuf]) -> Result<RefreshSummary> {
        let mut summary = RefreshSummary::default();
        if paths.is_empty() {
            return Ok(summary);
        }

        let roots = match self.client.library_roots().await {
            Ok(roots) => roots,
            Err(e) => {
                let mut stats = self.stats.lock().await;
                stats.calls += 1;
                stats.last_error = Some(e.to_string());
                return Err(MediaError::LibraryRoots(e));
            }
        };

        // Longest mount first so nested libraries win
        let mut libraries: Vec<(String, LibraryRoot)> = roots
            .into_iter()
            .map(|root| (normalize(&root.mount_path), root))
            .filter(|(mount, _)| !mount.is_empty())
            .collect();
        libraries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut seen = HashSet::new();
        let mut unmatched = 0u64;
        let mut last_error = None;

        for path in paths {
            let Some(library) = self.match_library(&libraries, path) else {
                debug!(path = %path.display(), "No library covers path");
                unmatched += 1;
                continue;
            };

            if !seen.insert(library.id.clone()) {
                continue;
            }
            summary.processed.push(library.id.clone());

            match self.client.refresh_library(&library.id).await {
                Ok(true) => {
                    summary.success += 1;
                    info!(library = %library.name, id = %library.id, "Requested library refresh");
                }
                Ok(false) => {
                    summary.failed += 1;
                    warn!(library = %library.name, id = %library.id, "Media server rejected refresh");
                    last_error = Some(format!("refresh rejected for library {}", library.id));
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(library = %library.name, id = %library.id, error = %e, "Library refresh failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        let mut stats = self.stats.lock().await;
        stats.calls += 1;
        stats.refreshes_succeeded += summary.success;
        stats.refreshes_failed += summary.failed;
        stats.unmatched_paths += unmatched;
        stats.last_refresh_at = Some(Utc::now());
        if last_error.is_some() {
            stats.last_error = last_error;
        }

        Ok(summary)
    }
}

impl std::fmt::Debug for RefreshNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshNotifier")
            .field("mapping", &self.mapping)
            .finish()
    }
}

/// Refresher used when media server integration is turned off.
#[derive(Debug, Default)]
pub struct DisabledRefresher;

#[async_trait]
impl PathRefresher for DisabledRefresher {
    async fn refresh_paths(&self, paths: &[PathBuf]) -> Result<RefreshSummary> {
        debug!(paths = paths.len(), "Media server disabled, skipping refresh");
        Ok(RefreshSummary::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use mockall::mock;
    use mockall::predicate::eq;
    use std::collections::BTreeMap;

    mock! {
        MediaClient {}

        #[async_trait]
        impl MediaServerClient for MediaClient {
            async fn library_roots(&self) -> BridgeResult<Vec<LibraryRoot>>;
            async fn refresh_library(&self, library_id: &str) -> BridgeResult<bool>;
        }
    }

    fn libraries() -> Vec<LibraryRoot> {
        vec![
            LibraryRoot::new("tv", "TV Shows", "/media/tv"),
            LibraryRoot::new("movies", "Movies", "/media/movies"),
            LibraryRoot::new("anime", "Anime", "/media/tv/anime"),
        ]
    }

    fn notifier(client: MockMediaClient) -> RefreshNotifier {
        let mut rules = BTreeMap::new();
        rules.insert("/mnt/links".to_string(), "/media".to_string());
        RefreshNotifier::new(Arc::new(client), PathMapping::new(&rules))
    }

    #[tokio::test]
    async fn test_same_library_refreshed_once() {
        let mut client = MockMediaClient::new();
        client
            .expect_library_roots()
            .times(1)
            .returning(|| Ok(libraries()));
        client
            .expect_refresh_library()
            .with(eq("tv"))
            .times(1)
            .returning(|_| Ok(true));

        let notifier = notifier(client);
        let summary = notifier
            .refresh_paths(&[
                PathBuf::from("/mnt/links/tv/Show/S01/e01.mkv"),
                PathBuf::from("/mnt/links/tv/Show/S01/e02.mkv"),
            ])
            .await
            .unwrap();

        assert_eq!(summary.success, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.processed, vec!["tv".to_string()]);
    }

    #[tokio::test]
    async fn test_nested_library_wins_and_unmatched_skipped() {
        let mut client = MockMediaClient::new();
        client.expect_library_roots().returning(|| Ok(libraries()));
        client
            .expect_refresh_library()
            .with(eq("anime"))
            .times(1)
            .returning(|_| Ok(true));
        client
            .expect_refresh_library()
            .with(eq("movies"))
            .times(1)
            .returning(|_| Ok(true));

        let notifier = notifier(client);
        let summary = notifier
            .refresh_paths(&[
                PathBuf::from("/mnt/links/tv/anime/Show/e01.mkv"),
                PathBuf::from("/mnt/links/movies/Film/film.mkv"),
                PathBuf::from("/elsewhere/file.mkv"),
            ])
            .await
            .unwrap();

        assert_eq!(summary.success, 2);
        assert_eq!(
            summary.processed,
            vec!["anime".to_string(), "movies".to_string()]
        );
        assert_eq!(notifier.stats().await.unmatched_paths, 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_counted() {
        let mut client = MockMediaClient::new();
        client.expect_library_roots().returning(|| Ok(libraries()));
        client
            .expect_refresh_library()
            .with(eq("tv"))
            .returning(|_| Err(BridgeError::Transient("timeout".into())));
        client
            .expect_refresh_library()
            .with(eq("movies"))
            .returning(|_| Ok(false));

        let notifier = notifier(client);
        let summary = notifier
            .refresh_paths(&[
                PathBuf::from("/mnt/links/tv/Show/e01.mkv"),
                PathBuf::from("/mnt/links/movies/Film/film.mkv"),
            ])
            .await
            .unwrap();

        assert_eq!(summary.success, 0);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.processed.len(), 2);

        let stats = notifier.stats().await;
        assert_eq!(stats.refreshes_failed, 2);
        assert!(stats.last_error.is_some());
    }

    #[tokio::test]
    async fn test_library_roots_failure_propagates() {
        let mut client = MockMediaClient::new();
        client
            .expect_library_roots()
            .returning(|| Err(BridgeError::Transient("connection refused".into())));
        client.expect_refresh_library().never();

        let notifier = notifier(client);
        let result = notifier
            .refresh_paths(&[PathBuf::from("/mnt/links/tv/Show/e01.mkv")])
            .await;
        assert!(matches!(result, Err(MediaError::LibraryRoots(_))));
    }

    #[tokio::test]
    async fn test_empty_paths_skip_server() {
        let mut client = MockMediaClient::new();
        client.expect_library_roots().never();

        let notifier = notifier(client);
        let summary = notifier.refresh_paths(&[]).await.unwrap();
        assert_eq!(summary, RefreshSummary::default());
    }

    #[tokio::test]
    async fn test_disabled_refresher() {
        let summary = DisabledRefresher
            .refresh_paths(&[PathBuf::from("/mnt/links/tv/a.mkv")])
            .await
            .unwrap();
        assert!(summary.processed.is_empty());
    }
}
