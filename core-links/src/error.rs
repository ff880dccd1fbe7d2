use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Invalid relative path '{0}'")]
    InvalidPath(String),

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Filesystem walk failed: {0}")]
    Walk(String),
}

impl LinkError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> LinkError + '_ {
        move |source| LinkError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
