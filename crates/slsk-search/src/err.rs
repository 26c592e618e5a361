//! Declare error types for slsk-search

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use slsk_error::{ErrorKind, HasKind};

/// An error returned by the search service or resolver.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum SearchError {
    /// No search with the given id exists.
    #[error("no search with id {id}")]
    NotFound {
        /// The id we looked for.
        id: Uuid,
    },

    /// A search with the given id already exists.
    #[error("a search with id {id} already exists")]
    AlreadyExists {
        /// The conflicting id.
        id: Uuid,
    },

    /// The searches database failed.
    #[error("searches database error")]
    Database(#[source] Arc<rusqlite::Error>),

    /// A persisted record could not be decoded.
    #[error("malformed persisted search record: {detail}")]
    MalformedRecord {
        /// What was wrong with it.
        detail: String,
    },

    /// The peer-protocol backend reported a failure.
    #[error("peer protocol failure: {message}")]
    Backend {
        /// The backend's description of the failure.
        message: String,
    },

    /// A lock in the service was poisoned.  This indicates a bug.
    #[error("search service poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for SearchError {
    fn from(e: rusqlite::Error) -> Self {
        SearchError::Database(Arc::new(e))
    }
}

impl HasKind for SearchError {
    fn kind(&self) -> ErrorKind {
        match self {
            SearchError::NotFound { .. } => ErrorKind::NotFound,
            SearchError::AlreadyExists { .. } => ErrorKind::Conflict,
            SearchError::Database(_) | SearchError::MalformedRecord { .. } => ErrorKind::Internal,
            SearchError::Backend { .. } => ErrorKind::PeerProtocol,
            SearchError::Poisoned => ErrorKind::Internal,
        }
    }
}
