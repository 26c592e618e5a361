//! Declare error types for slsk-shares

use thiserror::Error;

use slsk_error::{ErrorKind, HasKind};

/// An error returned by the share index or a repository.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ShareError {
    /// No host claims the given virtual path.
    #[error("no share claims {filename:?}")]
    NotFound {
        /// The virtual path we failed to resolve.
        filename: String,
    },

    /// A refresh was requested while another refresh was still running.
    #[error("a share scan is already in progress")]
    ScanAlreadyInProgress,

    /// A repository failed content validation.
    #[error("share repository rejected: {reason}")]
    Validation {
        /// Why the repository was rejected.
        reason: String,
    },

    /// A repository dump could not be deserialized.
    #[error("malformed share repository dump")]
    MalformedDump(#[source] std::sync::Arc<serde_json::Error>),

    /// The host table lock was poisoned.  This indicates a bug.
    #[error("share index poisoned")]
    Poisoned,
}

impl HasKind for ShareError {
    fn kind(&self) -> ErrorKind {
        match self {
            ShareError::NotFound { .. } => ErrorKind::NotFound,
            ShareError::ScanAlreadyInProgress => ErrorKind::ScanAlreadyInProgress,
            ShareError::Validation { .. } => ErrorKind::ShareValidation,
            ShareError::MalformedDump(_) => ErrorKind::ShareValidation,
            ShareError::Poisoned => ErrorKind::Internal,
        }
    }
}
