use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Capability missing: {capability} - {message}")]
    CapabilityMissing { capability: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),

    #[error("Link error: {0}")]
    Link(#[from] core_links::LinkError),

    #[error("Media server error: {0}")]
    Media(#[from] core_media::MediaError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
