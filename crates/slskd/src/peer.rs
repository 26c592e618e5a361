//! Seam implementations for the peer-protocol client.
//!
//! The wire client (connection framing, login, distributed search
//! plumbing) is an external collaborator; the daemon consumes it only
//! through the subsystem seam traits.  A concrete client plugs in by
//! providing a [`PeerClients`] bundle.  Until one is wired in, the
//! [`unconfigured`] bundle keeps the daemon honest: the connection
//! watchdog parks for missing credentials, outgoing searches error, and
//! every user maps to the `default` scheduler group.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use slsk_connmgr::{ConnectError, DisconnectCause, ServerEndpoint};
use slsk_search::{
    CompletionReason, PeerResponse, SearchBackend, SearchError, SearchOptions, SearchScope,
};
use slsk_transfers::{UserService, DEFAULT_GROUP};

/// The peer-protocol collaborators the daemon needs.
#[derive(Clone)]
#[non_exhaustive]
pub struct PeerClients {
    /// The server connection, supervised by the watchdog.
    pub server: Arc<dyn ServerEndpoint>,
    /// The distributed-search backend.
    pub search: Arc<dyn SearchBackend>,
    /// The user classification source.
    pub users: Arc<dyn UserService>,
}

/// A bundle with no wire client behind it.
pub fn unconfigured() -> PeerClients {
    PeerClients {
        server: Arc::new(UnconfiguredEndpoint),
        search: Arc::new(UnconfiguredBackend),
        users: Arc::new(DefaultGroupUsers),
    }
}

/// A server endpoint with no client behind it.
struct UnconfiguredEndpoint;

#[async_trait]
impl ServerEndpoint for UnconfiguredEndpoint {
    async fn connect(&self) -> Result<(), ConnectError> {
        // Parks the watchdog without counting as a failure worth
        // retrying.
        Err(ConnectError::MissingCredentials)
    }

    async fn disconnected(&self) -> DisconnectCause {
        std::future::pending().await
    }

    async fn disconnect(&self, _cause: DisconnectCause) {}
}

/// A search backend with no client behind it.
struct UnconfiguredBackend;

#[async_trait]
impl SearchBackend for UnconfiguredBackend {
    fn next_token(&self) -> u32 {
        0
    }

    async fn run(
        &self,
        _text: String,
        _token: u32,
        _scope: SearchScope,
        _options: SearchOptions,
        _responses: mpsc::Sender<PeerResponse>,
        _cancel: CancellationToken,
    ) -> Result<CompletionReason, SearchError> {
        Err(SearchError::Backend {
            message: "no peer-protocol client configured".into(),
        })
    }
}

/// Maps every user to the default group.
struct DefaultGroupUsers;

impl UserService for DefaultGroupUsers {
    fn group_for(&self, _username: &str) -> String {
        DEFAULT_GROUP.to_owned()
    }
}
