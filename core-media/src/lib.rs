//! # Media Server Refresh
//!
//! Maps changed link paths onto media server libraries and issues one
//! refresh per affected library.
//!
//! ## Overview
//!
//! - [`RefreshNotifier`] wraps a [`MediaServerClient`](bridge_traits::MediaServerClient)
//! - [`PathRefresher`] is the seam the event batcher depends on
//! - [`PathMapping`] rewrites local prefixes into the server's view of the tree

pub mod error;
pub mod notifier;
pub mod path_mapping;

pub use error::{MediaError, Result};
pub use notifier::{DisabledRefresher, NotifierStats, PathRefresher, RefreshNotifier, RefreshSummary};
pub use path_mapping::PathMapping;
