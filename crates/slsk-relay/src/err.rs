//! Declare error types for slsk-relay

use thiserror::Error;
use uuid::Uuid;

use slsk_async_utils::WaitError;
use slsk_error::{ErrorKind, HasKind};
use slsk_shares::ShareError;

/// An error returned by the relay controller or agent.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum RelayError {
    /// The named agent is not registered.
    #[error("agent {name:?} is not registered")]
    UnknownAgent {
        /// The agent we looked for.
        name: String,
    },

    /// A credential or capability token did not validate.
    ///
    /// Tokens are one-shot: a failed validation still consumes the
    /// token, and a second attempt fails here too.
    #[error("relay authorization failed")]
    Unauthorized,

    /// A response arrived for which no request is waiting.
    #[error("no pending request for id {id}")]
    UnsolicitedResponse {
        /// The orphaned request id.
        id: Uuid,
    },

    /// The agent did not produce the stream (or answer) in time.
    #[error("relay operation timed out")]
    Timeout,

    /// The agent reported a failure while servicing our request.
    #[error("remote agent failure: {message}")]
    RemoteAgent {
        /// The agent's description of the failure.
        message: String,
    },

    /// The peer-facing transfer failed and the agent's stream was
    /// unwound.
    #[error("file stream aborted: {message}")]
    StreamAborted {
        /// Why the stream was abandoned.
        message: String,
    },

    /// The operation's rendezvous was abandoned mid-flight.
    #[error("relay operation cancelled")]
    Cancelled,

    /// A share repository problem (validation, installation).
    #[error("share repository error")]
    Share(#[from] ShareError),

    /// The hub transport failed to deliver a message.
    #[error("hub transport failure: {message}")]
    Transport {
        /// What the transport reported.
        message: String,
    },

    /// The agent has no such file (local resolution failed).
    #[error("no shared file {filename:?}")]
    NoSuchFile {
        /// The virtual path we failed to resolve.
        filename: String,
    },

    /// A lock was poisoned.  This indicates a bug.
    #[error("relay coordinator poisoned")]
    Poisoned,
}

impl HasKind for RelayError {
    fn kind(&self) -> ErrorKind {
        match self {
            RelayError::UnknownAgent { .. } => ErrorKind::NotFound,
            RelayError::Unauthorized => ErrorKind::Unauthorized,
            RelayError::UnsolicitedResponse { .. } => ErrorKind::NotFound,
            RelayError::Timeout => ErrorKind::Timeout,
            RelayError::RemoteAgent { .. } => ErrorKind::RemoteAgent,
            RelayError::StreamAborted { .. } => ErrorKind::PeerProtocol,
            RelayError::Cancelled => ErrorKind::Cancelled,
            RelayError::Share(e) => e.kind(),
            RelayError::Transport { .. } => ErrorKind::PeerProtocol,
            RelayError::NoSuchFile { .. } => ErrorKind::NotFound,
            RelayError::Poisoned => ErrorKind::Internal,
        }
    }
}

impl RelayError {
    /// Translate a waiter outcome from the request/response rendezvous.
    pub(crate) fn from_wait(e: WaitError) -> Self {
        match e {
            WaitError::Timeout => RelayError::Timeout,
            WaitError::Failed { message } => RelayError::RemoteAgent { message },
            WaitError::AlreadyPending => RelayError::Transport {
                message: "rendezvous key already in use".into(),
            },
            WaitError::Abandoned => RelayError::Cancelled,
            WaitError::Poisoned => RelayError::Poisoned,
            _ => RelayError::Poisoned,
        }
    }
}
