//! # Link Projection
//!
//! Mirrors remote files into a local tree of symbolic links that a media
//! server can scan.
//!
//! ## Overview
//!
//! - [`SymlinkProjector`] creates, removes, verifies and rebuilds links
//! - [`LinkProjection`] is the narrow seam the event batcher depends on
//! - [`backup`] names and sweeps `<original>.bak.<timestamp>` files
//!
//! The projector is the only writer of the target tree.

pub mod backup;
pub mod error;
pub mod projector;

pub use error::{LinkError, Result};
pub use projector::{LinkProjection, LinkReport, ProjectorStats, SymlinkEntry, SymlinkProjector};
