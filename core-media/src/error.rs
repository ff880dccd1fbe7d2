use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Failed to fetch library roots: {0}")]
    LibraryRoots(#[source] BridgeError),
}

pub type Result<T> = std::result::Result<T, MediaError>;
