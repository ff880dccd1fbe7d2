//! Local -> media server path translation.
//!
//! The media server usually sees the link tree under a different mount
//! point (a container volume, an NFS export). Paths are compared on whole
//! components, so `/media/tv` never matches `/media/tvshows`.

use std::collections::BTreeMap;

/// Normalizes separators and drops trailing slashes. The root `/` stays.
pub fn normalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let trimmed = unified.trim_end_matches('/');
    if trimmed.is_empty() && unified.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// True when `prefix` equals `path` or is an ancestor of it. Both must be
/// normalized.
pub fn is_component_prefix(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Longest-prefix rewrite table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMapping {
    /// (local, server), longest local prefix first
    rules: Vec<(String, String)>,
}

impl PathMapping {
    pub fn new(rules: &BTreeMap<String, String>) -> Self {
        let mut rules: Vec<(String, String)> = rules
            .iter()
            .map(|(local, server)| (normalize(local), normalize(server)))
            .collect();
        rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrites the longest matching local prefix. Unmatched paths come back
    /// normalized but otherwise unchanged.
    pub fn apply(&self, path: &str) -> String {
        let path = normalize(path);
        for (local, server) in &self.rules {
            if is_component_prefix(local, &path) {
                let rest = &path[local.len()..];
                let rest = rest.trim_start_matches('/');
                return match (server.as_str(), rest) {
                    (_, "") => server.clone(),
                    ("/", rest) => format!("/{}", rest),
                    (server, rest) => format!("{}/{}", server, rest),
                };
            }
        }
        path
    }
}
