use bridge_traits::error::BridgeError;
use core_links::LinkError;
use core_media::MediaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Remote listing failed: {0}")]
    Remote(#[from] BridgeError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid snapshot record: {0}")]
    InvalidRecord(String),

    #[error("Link operation failed: {0}")]
    Link(#[from] LinkError),

    #[error("Media server refresh failed: {0}")]
    Media(#[from] MediaError),

    #[error("Event queue closed")]
    QueueClosed,

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Credential failures stop the monitor instead of being retried.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Remote(e) if e.is_auth())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
