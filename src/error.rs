//! Error types for the pairsync cache layer
//!
//! Cache misses (`NotFound`, `Expired`) are not errors: read paths return
//! `Option` and record the miss reason in metrics. The variants below are the
//! failures that can reach a caller.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache and sync layer
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structured store error
    #[error("Structured store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage failure that is not an I/O or SQL error (e.g. budget refusal)
    #[error("Storage failure in {component}: {reason}")]
    Storage { component: String, reason: String },

    /// Remote call failed (network, auth, or a `success: false` response)
    #[error("Remote call '{operation}' failed: {reason}")]
    Remote { operation: String, reason: String },

    /// Connectivity is unavailable and no cached copy is usable
    #[error("Offline and no cached copy of {0}")]
    Offline(String),

    /// A stored record could not be decoded; it has been deleted
    #[error("Corrupt record {key} in {component}")]
    CorruptRecord { component: String, key: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a remote failure
    pub fn remote(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Remote {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Build a storage failure
    pub fn storage(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Storage {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// True for failures of local persistence (disk, structured store)
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Sqlite(_) | Error::Storage { .. } | Error::CorruptRecord { .. }
        )
    }

    /// True for failures talking to a remote collaborator
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote { .. } | Error::Offline(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::storage("image", "disk full").is_storage());
        assert!(Error::remote("getPartnerLocation", "timeout").is_remote());
        assert!(Error::Offline("/api/feed".into()).is_remote());
        assert!(!Error::Config("bad".into()).is_storage());
    }

    #[test]
    fn test_error_display() {
        let err = Error::remote("write", "permission denied");
        assert_eq!(
            err.to_string(),
            "Remote call 'write' failed: permission denied"
        );
        let err = Error::CorruptRecord {
            component: "profile".into(),
            key: "profile.record".into(),
        };
        assert_eq!(err.to_string(), "Corrupt record profile.record in profile");
    }
}
