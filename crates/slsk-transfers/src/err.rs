//! Declare error types for slsk-transfers

use thiserror::Error;

use slsk_error::{ErrorKind, HasKind};

/// An error returned by the upload queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransferError {
    /// The named user has nothing queued.
    #[error("no queued uploads for user {username:?}")]
    UnknownUser {
        /// The user we looked for.
        username: String,
    },

    /// The named user has nothing queued for the given file.
    #[error("no queued upload of {filename:?} for user {username:?}")]
    UnknownUpload {
        /// The user we looked for.
        username: String,
        /// The file we looked for.
        filename: String,
    },

    /// The upload was removed before it was ever released.
    #[error("upload removed before release")]
    Cancelled,

    /// The queue's lock was poisoned.  This indicates a bug.
    #[error("upload queue poisoned")]
    Poisoned,
}

impl HasKind for TransferError {
    fn kind(&self) -> ErrorKind {
        match self {
            TransferError::UnknownUser { .. } | TransferError::UnknownUpload { .. } => {
                ErrorKind::NotFound
            }
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::Poisoned => ErrorKind::Internal,
        }
    }
}
