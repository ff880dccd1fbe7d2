//! Workspace entry crate.
//!
//! Re-exports the sync service façade together with the configuration and
//! logging helpers a host binary needs to run it.
//!
//! ```rust,ignore
//! use graylink::{init_logging, CoreConfig, CoreDependencies, LoggingConfig, SyncService};
//!
//! init_logging(LoggingConfig::default())?;
//! let config = CoreConfig::builder()
//!     .database_path("data/graylink.db")
//!     .source_dir("/mnt/gdrive")
//!     .target_dir("/mnt/links")
//!     .build()?;
//! let service = SyncService::open(config, CoreDependencies::new(lister)).await?;
//! service.start().await?;
//! ```

pub use core_runtime::config::CoreConfig;
pub use core_runtime::logging::{init_logging, LogFormat, LogLevel, LoggingConfig};
pub use core_service::*;
