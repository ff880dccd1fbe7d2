use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    /// Network hiccup, timeout or rate limit. Safe to retry.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Credentials are missing, expired or rejected. Retrying will not help.
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Returns true for failures that may succeed when attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Transient(_) | BridgeError::Io(_))
    }

    /// Returns true when the collaborator rejected our credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, BridgeError::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert!(BridgeError::Transient("timeout".into()).is_transient());
        assert!(!BridgeError::Transient("timeout".into()).is_auth());
        assert!(BridgeError::Auth("expired".into()).is_auth());
        assert!(!BridgeError::Auth("expired".into()).is_transient());
        assert!(!BridgeError::OperationFailed("boom".into()).is_transient());
    }
}
