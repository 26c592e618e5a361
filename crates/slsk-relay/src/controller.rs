//! The controller half of the relay.
//!
//! The controller authenticates agents over a duplex hub channel,
//! aggregates their shares into the share index, and proxies file
//! bytes from an agent's side-channel HTTP upload to the peer-facing
//! transfer.  Every side-channel action is authorised by a short-lived,
//! one-shot capability token.
//!
//! The file-stream protocol is a pair of keyed waits:
//!
//! 1. `get_file_stream` registers wait **W1** and pushes
//!    `request_file_upload` to the agent over the hub.
//! 2. The agent opens an HTTP upload whose handler calls
//!    [`RelayController::handle_file_stream`]: it registers the
//!    indefinite wait **W2**, completes W1 with the still-open request
//!    body, and suspends on W2.
//! 3. The upload executor drains the stream into the peer network and
//!    calls [`RelayController::try_close_file_stream`], which resolves
//!    W2 and lets the agent's upload finish.
//!
//! A failure anywhere propagates along the same pair, so no stream is
//! ever silently truncated.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};
use uuid::Uuid;

use slsk_async_utils::{ExpiringTokenCache, WaitKey, Waiter};
use slsk_error::ErrorReport as _;
use slsk_shares::{MemoryRepository, Share, ShareIndex, ShareRepository};

use crate::crypto;
use crate::err::RelayError;

/// Time an agent has to answer an authentication challenge.
const AUTH_TOKEN_TTL: Duration = Duration::from_secs(10);
/// Time an agent has to deliver its shares after asking to upload them.
const SHARE_UPLOAD_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);
/// Window within which download-completed notifications validate.
const DOWNLOAD_NOTIFY_TTL: Duration = Duration::from_secs(10 * 60);

/// A still-open byte stream handed from a transport handler to the
/// upload executor.
pub type AgentStream = Pin<Box<dyn AsyncRead + Send>>;

/// An agent's answer to a file-info probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)] // plain data carrier
pub struct FileInfo {
    /// Whether the agent has the file.
    pub exists: bool,
    /// The file's length in bytes (0 when absent).
    pub length: u64,
}

/// The push half of one agent's hub connection.
///
/// Implemented by the hub transport; the controller holds one per
/// registered agent and never sees the transport behind it.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    /// Push an authentication challenge.
    async fn challenge(&self, auth_token: &str) -> Result<(), RelayError>;
    /// Ask the agent to upload a file's bytes over the side channel.
    async fn request_file_upload(
        &self,
        filename: &str,
        start_offset: u64,
        id: Uuid,
    ) -> Result<(), RelayError>;
    /// Ask the agent whether it has a file, and how large it is.
    async fn request_file_info(&self, filename: &str, id: Uuid) -> Result<(), RelayError>;
    /// Tell the agent a local download finished.
    async fn notify_file_download_completed(
        &self,
        relative_path: &str,
        id: Uuid,
    ) -> Result<(), RelayError>;
}

/// Credentials for one permitted agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)] // plain data carrier
pub struct RelayAgentCredentials {
    /// The agent's instance name.
    pub name: String,
    /// The shared secret.
    pub secret: String,
}

/// Controller-side relay configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)] // plain data carrier
pub struct RelayControllerConfig {
    /// The agents this controller accepts.
    pub agents: Vec<RelayAgentCredentials>,
}

impl RelayControllerConfig {
    /// Look up the secret for an agent name.
    fn secret_for(&self, name: &str) -> Option<&str> {
        self.agents
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.secret.as_str())
    }
}

/// One authenticated agent.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AgentRegistration {
    /// The agent's instance name.
    pub name: String,
    /// The hub connection the agent authenticated on.
    pub connection_id: String,
    /// The shares the agent has declared, if it has uploaded them.
    pub shares: Vec<Share>,
    /// When the agent authenticated.
    pub authenticated_at: SystemTime,
}

/// A registration together with its push channel.
struct RegistrationEntry {
    /// The externally visible registration.
    registration: AgentRegistration,
    /// The push half of the agent's hub connection.
    channel: Arc<dyn AgentChannel>,
}

/// The relay controller.
pub struct RelayController {
    /// Permitted agents and their secrets.
    config: RelayControllerConfig,
    /// Where agents' shares are installed.
    index: Arc<ShareIndex>,
    /// Registered agents, by name.
    registrations: Mutex<HashMap<String, RegistrationEntry>>,
    /// Channels for connections that have been challenged but have not
    /// yet logged in, by connection id.
    pending_channels: Mutex<HashMap<String, Arc<dyn AgentChannel>>>,
    /// Outstanding auth challenges, by connection id.
    auth_tokens: ExpiringTokenCache<String, String>,
    /// Outstanding share-upload capabilities: token id → agent name.
    share_tokens: ExpiringTokenCache<Uuid, String>,
    /// Outstanding file-stream capabilities: request id → agent name.
    stream_tokens: ExpiringTokenCache<Uuid, String>,
    /// Download-completed notifications, idempotent within their TTL.
    notify_tokens: ExpiringTokenCache<(String, Uuid), ()>,
    /// W1: get_file_stream waiting for the agent's stream.
    stream_waiters: Waiter<AgentStream>,
    /// W2: the transport handler waiting for the transfer to finish.
    handler_waiters: Waiter<()>,
    /// File-info probes waiting for the agent's answer.
    info_waiters: Waiter<FileInfo>,
}

/// Build the W1 key for a file-stream request.
fn stream_key(agent: &str, id: Uuid) -> WaitKey {
    WaitKey::new(["file_stream".to_owned(), agent.to_owned(), id.to_string()])
}

/// Build the W2 key for a file-stream handler.
fn handler_key(agent: &str, id: Uuid) -> WaitKey {
    WaitKey::new([
        "file_stream_response".to_owned(),
        agent.to_owned(),
        id.to_string(),
    ])
}

/// Build the key for a file-info probe.
fn info_key(agent: &str, id: Uuid) -> WaitKey {
    WaitKey::new(["file_info".to_owned(), agent.to_owned(), id.to_string()])
}

impl RelayController {
    /// Construct a controller over the given index.
    pub fn new(config: RelayControllerConfig, index: Arc<ShareIndex>) -> Arc<Self> {
        Arc::new(RelayController {
            config,
            index,
            registrations: Mutex::new(HashMap::new()),
            pending_channels: Mutex::new(HashMap::new()),
            auth_tokens: ExpiringTokenCache::new(),
            share_tokens: ExpiringTokenCache::new(),
            stream_tokens: ExpiringTokenCache::new(),
            notify_tokens: ExpiringTokenCache::new(),
            stream_waiters: Waiter::new(),
            handler_waiters: Waiter::new(),
            info_waiters: Waiter::new(),
        })
    }

    /// Handle a fresh hub connection: issue a challenge.
    ///
    /// The token is cached against the connection id for
    /// [`AUTH_TOKEN_TTL`] and pushed to the agent over its channel.
    pub async fn handle_connection(
        &self,
        connection_id: &str,
        channel: Arc<dyn AgentChannel>,
    ) -> Result<(), RelayError> {
        let token = crypto::generate_token();
        self.auth_tokens
            .set(connection_id.to_owned(), token.clone(), AUTH_TOKEN_TTL);
        {
            let mut pending = self
                .pending_channels
                .lock()
                .map_err(|_| RelayError::Poisoned)?;
            pending.insert(connection_id.to_owned(), Arc::clone(&channel));
        }
        debug!(connection = %connection_id, "challenging new hub connection");
        channel.challenge(&token).await
    }

    /// Handle an agent's `login`.
    ///
    /// The challenge token is one-shot: it is consumed by this call
    /// whether or not the credential validates, so a failed login
    /// cannot be retried against the same challenge.
    pub fn login(
        &self,
        connection_id: &str,
        agent_name: &str,
        credential: &str,
    ) -> Result<(), RelayError> {
        let token = self
            .auth_tokens
            .take(&connection_id.to_owned())
            .ok_or(RelayError::Unauthorized)?;
        let secret = self
            .config
            .secret_for(agent_name)
            .ok_or(RelayError::Unauthorized)?;
        if !crypto::verify_credential(secret, agent_name, &token, credential) {
            warn!(agent = %agent_name, "agent presented a bad credential");
            return Err(RelayError::Unauthorized);
        }

        let channel = {
            let mut pending = self
                .pending_channels
                .lock()
                .map_err(|_| RelayError::Poisoned)?;
            pending
                .remove(connection_id)
                .ok_or(RelayError::Unauthorized)?
        };

        let mut registrations = self
            .registrations
            .lock()
            .map_err(|_| RelayError::Poisoned)?;
        if let Some(existing) = registrations.get(agent_name) {
            if existing.registration.connection_id == connection_id {
                // Same agent, same connection: nothing to do.
                return Ok(());
            }
            info!(agent = %agent_name, "agent re-registered from a new connection");
        } else {
            info!(agent = %agent_name, "agent registered");
        }
        registrations.insert(
            agent_name.to_owned(),
            RegistrationEntry {
                registration: AgentRegistration {
                    name: agent_name.to_owned(),
                    connection_id: connection_id.to_owned(),
                    shares: Vec::new(),
                    authenticated_at: SystemTime::now(),
                },
                channel,
            },
        );
        Ok(())
    }

    /// Handle a hub connection going away.
    ///
    /// If an agent was registered on it, the registration and the
    /// agent's host binding in the share index are dropped.
    pub fn handle_disconnect(&self, connection_id: &str) -> Result<(), RelayError> {
        self.auth_tokens.remove(&connection_id.to_owned());
        if let Ok(mut pending) = self.pending_channels.lock() {
            pending.remove(connection_id);
        }
        let name = {
            let mut registrations = self
                .registrations
                .lock()
                .map_err(|_| RelayError::Poisoned)?;
            let name = registrations
                .iter()
                .find(|(_, e)| e.registration.connection_id == connection_id)
                .map(|(name, _)| name.clone());
            if let Some(name) = &name {
                registrations.remove(name);
            }
            name
        };
        if let Some(name) = name {
            info!(agent = %name, "agent disconnected");
            self.index.remove_host(&name)?;
        }
        Ok(())
    }

    /// Handle an agent's `begin_share_upload`: issue a share-upload
    /// capability token.
    pub fn begin_share_upload(&self, connection_id: &str) -> Result<Uuid, RelayError> {
        let name = self
            .registered_name_for_connection(connection_id)?
            .ok_or(RelayError::Unauthorized)?;
        let id = Uuid::new_v4();
        self.share_tokens.set(id, name, SHARE_UPLOAD_TOKEN_TTL);
        Ok(id)
    }

    /// Install an agent's uploaded shares.
    ///
    /// Called by the side-channel transport with the multipart parts:
    /// the capability token from the URL, the declared agent name and
    /// credential, the declared shares, and the serialized repository.
    pub fn handle_share_upload(
        &self,
        token: Uuid,
        agent_name: &str,
        credential: &str,
        shares: Vec<Share>,
        repository_dump: &[u8],
    ) -> Result<(), RelayError> {
        let holder = self.share_tokens.take(&token).ok_or(RelayError::Unauthorized)?;
        if holder != agent_name {
            return Err(RelayError::Unauthorized);
        }
        let secret = self
            .config
            .secret_for(agent_name)
            .ok_or(RelayError::Unauthorized)?;
        if !crypto::verify_credential(secret, agent_name, &token.to_string(), credential) {
            return Err(RelayError::Unauthorized);
        }

        let repository = MemoryRepository::from_dump_bytes(repository_dump)?;
        repository.try_validate()?;
        let file_count = repository.file_count();
        self.index
            .add_or_update_host(agent_name, shares.clone(), Arc::new(repository))?;

        let mut registrations = self
            .registrations
            .lock()
            .map_err(|_| RelayError::Poisoned)?;
        if let Some(entry) = registrations.get_mut(agent_name) {
            entry.registration.shares = shares;
        }
        info!(agent = %agent_name, files = file_count, "agent shares installed");
        Ok(())
    }

    /// Obtain a byte stream for a file that lives on an agent.
    ///
    /// Registers the W1 wait, pushes `request_file_upload` over the
    /// hub, and suspends until the agent's upload arrives (or the
    /// timeout elapses, releasing the capability token).
    pub async fn get_file_stream(
        &self,
        agent: &str,
        filename: &str,
        start_offset: u64,
        id: Uuid,
        timeout: Duration,
    ) -> Result<AgentStream, RelayError> {
        let channel = self.channel_for(agent)?;
        self.stream_tokens.set(id, agent.to_owned(), timeout);

        let wait = self
            .stream_waiters
            .wait(&stream_key(agent, id), timeout)
            .map_err(RelayError::from_wait)?;

        if let Err(e) = channel.request_file_upload(filename, start_offset, id).await {
            self.stream_tokens.remove(&id);
            self.stream_waiters
                .fail(&stream_key(agent, id), "hub push failed");
            return Err(e);
        }

        match wait.await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                // On timeout the capability must die with the wait, so a
                // late upload finds nothing to attach to.
                self.stream_tokens.remove(&id);
                Err(RelayError::from_wait(e))
            }
        }
    }

    /// Attach an agent's still-open upload stream to the waiting
    /// transfer, then suspend until the transfer finishes with it.
    ///
    /// This is the W2 side: the side-channel transport calls it with
    /// the request body and turns its return into the HTTP response.
    pub async fn handle_file_stream(
        &self,
        id: Uuid,
        agent_name: &str,
        credential: &str,
        stream: AgentStream,
    ) -> Result<(), RelayError> {
        let holder = self.stream_tokens.take(&id).ok_or(RelayError::Unauthorized)?;
        if holder != agent_name {
            return Err(RelayError::Unauthorized);
        }
        let secret = self
            .config
            .secret_for(agent_name)
            .ok_or(RelayError::Unauthorized)?;
        if !crypto::verify_credential(secret, agent_name, &id.to_string(), credential) {
            return Err(RelayError::Unauthorized);
        }

        // Register W2 before completing W1: the transfer may finish (and
        // call try_close_file_stream) the instant it has the stream.
        let wait = self
            .handler_waiters
            .wait_indefinitely(&handler_key(agent_name, id))
            .map_err(RelayError::from_wait)?;

        if !self.stream_waiters.complete(&stream_key(agent_name, id), stream) {
            // The requester is gone (timed out, most likely).  Unwind
            // our own registration and refuse the upload.
            self.handler_waiters
                .fail(&handler_key(agent_name, id), "no pending file stream request");
            let _ = wait.await;
            return Err(RelayError::UnsolicitedResponse { id });
        }

        match wait.await {
            Ok(()) => Ok(()),
            Err(slsk_async_utils::WaitError::Failed { message }) => {
                Err(RelayError::StreamAborted { message })
            }
            Err(e) => Err(RelayError::from_wait(e)),
        }
    }

    /// Resolve the W2 wait for a proxied stream, releasing the agent's
    /// upload request.
    ///
    /// Pass `error` when the peer-facing transfer failed, so the agent's
    /// upload fails too instead of appearing delivered.  Returns true if
    /// a handler was waiting.
    pub fn try_close_file_stream(
        &self,
        agent: &str,
        id: Uuid,
        error: Option<&str>,
    ) -> bool {
        match error {
            Some(message) => self.handler_waiters.fail(&handler_key(agent, id), message),
            None => self.handler_waiters.complete(&handler_key(agent, id), ()),
        }
    }

    /// Handle the agent's report that it cannot produce a requested
    /// stream.  Fails W1 and burns the capability token.
    pub fn notify_file_stream_exception(
        &self,
        id: Uuid,
        message: &str,
    ) -> Result<(), RelayError> {
        let agent = self
            .stream_tokens
            .take(&id)
            .ok_or(RelayError::UnsolicitedResponse { id })?;
        if !self.stream_waiters.fail(&stream_key(&agent, id), message) {
            return Err(RelayError::UnsolicitedResponse { id });
        }
        Ok(())
    }

    /// Probe an agent for a file's existence and length.
    pub async fn get_file_info(
        &self,
        agent: &str,
        filename: &str,
        id: Uuid,
        timeout: Duration,
    ) -> Result<FileInfo, RelayError> {
        let channel = self.channel_for(agent)?;
        let wait = self
            .info_waiters
            .wait(&info_key(agent, id), timeout)
            .map_err(RelayError::from_wait)?;
        if let Err(e) = channel.request_file_info(filename, id).await {
            self.info_waiters.fail(&info_key(agent, id), "hub push failed");
            return Err(e);
        }
        wait.await.map_err(RelayError::from_wait)
    }

    /// Handle an agent's answer to a file-info probe.
    ///
    /// An answer with no matching outstanding probe is rejected.
    pub fn handle_file_info_response(
        &self,
        agent: &str,
        id: Uuid,
        exists: bool,
        length: u64,
    ) -> Result<(), RelayError> {
        if !self
            .info_waiters
            .complete(&info_key(agent, id), FileInfo { exists, length })
        {
            return Err(RelayError::UnsolicitedResponse { id });
        }
        Ok(())
    }

    /// Tell every connected agent that a local download finished, and
    /// cache an idempotent notification token for it.
    pub async fn notify_file_download_completed(
        &self,
        relative_path: &str,
        id: Uuid,
    ) -> Result<(), RelayError> {
        self.notify_tokens.set(
            (relative_path.to_owned(), id),
            (),
            DOWNLOAD_NOTIFY_TTL,
        );
        let channels: Vec<(String, Arc<dyn AgentChannel>)> = {
            let registrations = self
                .registrations
                .lock()
                .map_err(|_| RelayError::Poisoned)?;
            registrations
                .iter()
                .map(|(name, e)| (name.clone(), Arc::clone(&e.channel)))
                .collect()
        };
        for (name, channel) in channels {
            if let Err(e) = channel
                .notify_file_download_completed(relative_path, id)
                .await
            {
                warn!(agent = %name, "download notification failed: {}", e.report());
            }
        }
        Ok(())
    }

    /// Validate a download-completed notification token.
    ///
    /// Unlike every other capability, this one is idempotent: it
    /// validates any number of times until it expires.
    pub fn validate_download_notification(&self, relative_path: &str, id: Uuid) -> bool {
        self.notify_tokens
            .get(&(relative_path.to_owned(), id))
            .is_some()
    }

    /// Snapshot the current registrations.
    pub fn registrations(&self) -> Result<Vec<AgentRegistration>, RelayError> {
        let registrations = self
            .registrations
            .lock()
            .map_err(|_| RelayError::Poisoned)?;
        let mut out: Vec<AgentRegistration> = registrations
            .values()
            .map(|e| e.registration.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// The push channel for a registered agent.
    fn channel_for(&self, agent: &str) -> Result<Arc<dyn AgentChannel>, RelayError> {
        let registrations = self
            .registrations
            .lock()
            .map_err(|_| RelayError::Poisoned)?;
        registrations
            .get(agent)
            .map(|e| Arc::clone(&e.channel))
            .ok_or_else(|| RelayError::UnknownAgent {
                name: agent.to_owned(),
            })
    }

    /// The registered agent name bound to a connection id, if any.
    fn registered_name_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<String>, RelayError> {
        let registrations = self
            .registrations
            .lock()
            .map_err(|_| RelayError::Poisoned)?;
        Ok(registrations
            .iter()
            .find(|(_, e)| e.registration.connection_id == connection_id)
            .map(|(name, _)| name.clone()))
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tokio::io::AsyncReadExt;

    /// A message the controller pushed over the fake hub.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Pushed {
        /// A challenge with its token.
        Challenge(String),
        /// A file-upload request.
        FileUpload(String, u64, Uuid),
        /// A file-info request.
        FileInfo(String, Uuid),
        /// A download-completed notification.
        DownloadCompleted(String, Uuid),
    }

    /// An [`AgentChannel`] that records everything pushed through it.
    #[derive(Default)]
    struct RecordingChannel {
        /// The push log.
        pushed: Mutex<Vec<Pushed>>,
    }

    impl RecordingChannel {
        fn log(&self) -> Vec<Pushed> {
            self.pushed.lock().unwrap().clone()
        }

        fn challenge_token(&self) -> String {
            self.log()
                .iter()
                .find_map(|p| match p {
                    Pushed::Challenge(t) => Some(t.clone()),
                    _ => None,
                })
                .expect("no challenge pushed")
        }
    }

    #[async_trait]
    impl AgentChannel for RecordingChannel {
        async fn challenge(&self, auth_token: &str) -> Result<(), RelayError> {
            self.pushed
                .lock()
                .unwrap()
                .push(Pushed::Challenge(auth_token.to_owned()));
            Ok(())
        }

        async fn request_file_upload(
            &self,
            filename: &str,
            start_offset: u64,
            id: Uuid,
        ) -> Result<(), RelayError> {
            self.pushed.lock().unwrap().push(Pushed::FileUpload(
                filename.to_owned(),
                start_offset,
                id,
            ));
            Ok(())
        }

        async fn request_file_info(&self, filename: &str, id: Uuid) -> Result<(), RelayError> {
            self.pushed
                .lock()
                .unwrap()
                .push(Pushed::FileInfo(filename.to_owned(), id));
            Ok(())
        }

        async fn notify_file_download_completed(
            &self,
            relative_path: &str,
            id: Uuid,
        ) -> Result<(), RelayError> {
            self.pushed
                .lock()
                .unwrap()
                .push(Pushed::DownloadCompleted(relative_path.to_owned(), id));
            Ok(())
        }
    }

    const AGENT: &str = "agent-1";
    const SECRET: &str = "s3cret";

    fn controller() -> (Arc<RelayController>, Arc<ShareIndex>) {
        let index = Arc::new(ShareIndex::new(slsk_shares::SharesConfig::default()));
        let config = RelayControllerConfig {
            agents: vec![RelayAgentCredentials {
                name: AGENT.to_owned(),
                secret: SECRET.to_owned(),
            }],
        };
        (RelayController::new(config, Arc::clone(&index)), index)
    }

    /// Run the whole handshake for `AGENT` on `conn`, returning the
    /// channel.
    async fn register(ctl: &RelayController, conn: &str) -> Arc<RecordingChannel> {
        let channel = Arc::new(RecordingChannel::default());
        ctl.handle_connection(conn, Arc::clone(&channel) as Arc<dyn AgentChannel>)
            .await
            .unwrap();
        let token = channel.challenge_token();
        let credential = crypto::compute_credential(SECRET, AGENT, &token);
        ctl.login(conn, AGENT, &credential).unwrap();
        channel
    }

    /// A dump for an agent repository with one file.
    fn dump() -> (Vec<Share>, Vec<u8>) {
        let mut repo = MemoryRepository::new(vec![Share {
            alias: "Music".into(),
        }]);
        repo.insert(
            slsk_shares::SharedFile {
                filename: r"Music\x\y.mp3".into(),
                size: 4,
                properties: slsk_shares::FileProperties::default(),
            },
            "/x/y.mp3",
        );
        (repo.shares().to_vec(), repo.to_dump_bytes().unwrap())
    }

    /// Wait until `cond` holds, yielding in between.
    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn handshake_registers_agent() {
        let (ctl, _index) = controller();
        register(&ctl, "conn-1").await;
        let regs = ctl.registrations().unwrap();
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].name, AGENT);
        assert_eq!(regs[0].connection_id, "conn-1");
    }

    #[tokio::test]
    async fn auth_token_is_one_shot_even_on_failure() {
        let (ctl, _index) = controller();
        let channel = Arc::new(RecordingChannel::default());
        ctl.handle_connection("conn-1", Arc::clone(&channel) as Arc<dyn AgentChannel>)
            .await
            .unwrap();
        let token = channel.challenge_token();

        // A wrong credential consumes the token...
        assert!(matches!(
            ctl.login("conn-1", AGENT, "bogus"),
            Err(RelayError::Unauthorized)
        ));
        // ...so the right one no longer validates either.
        let credential = crypto::compute_credential(SECRET, AGENT, &token);
        assert!(matches!(
            ctl.login("conn-1", AGENT, &credential),
            Err(RelayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn unknown_agent_name_is_rejected() {
        let (ctl, _index) = controller();
        let channel = Arc::new(RecordingChannel::default());
        ctl.handle_connection("conn-1", Arc::clone(&channel) as Arc<dyn AgentChannel>)
            .await
            .unwrap();
        let token = channel.challenge_token();
        let credential = crypto::compute_credential(SECRET, "stranger", &token);
        assert!(matches!(
            ctl.login("conn-1", "stranger", &credential),
            Err(RelayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn reregistration_replaces_prior_connection() {
        let (ctl, _index) = controller();
        register(&ctl, "conn-1").await;

        // Same connection again: a no-op, still one registration.
        let channel = Arc::new(RecordingChannel::default());
        ctl.handle_connection("conn-1", Arc::clone(&channel) as Arc<dyn AgentChannel>)
            .await
            .unwrap();
        let token = channel.challenge_token();
        let credential = crypto::compute_credential(SECRET, AGENT, &token);
        ctl.login("conn-1", AGENT, &credential).unwrap();
        assert_eq!(ctl.registrations().unwrap().len(), 1);

        // A different connection replaces the prior registration.
        register(&ctl, "conn-2").await;
        let regs = ctl.registrations().unwrap();
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].connection_id, "conn-2");
    }

    #[tokio::test]
    async fn share_upload_installs_host() {
        let (ctl, index) = controller();
        register(&ctl, "conn-1").await;

        let token = ctl.begin_share_upload("conn-1").unwrap();
        let credential = crypto::compute_credential(SECRET, AGENT, &token.to_string());
        let (shares, bytes) = dump();
        ctl.handle_share_upload(token, AGENT, &credential, shares, &bytes)
            .unwrap();

        assert_eq!(index.hosts().unwrap(), vec![AGENT.to_owned()]);
        let regs = ctl.registrations().unwrap();
        assert_eq!(regs[0].shares.len(), 1);

        // The token was consumed by the successful upload.
        let (shares, bytes) = dump();
        assert!(matches!(
            ctl.handle_share_upload(token, AGENT, &credential, shares, &bytes),
            Err(RelayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn share_upload_requires_registration() {
        let (ctl, _index) = controller();
        assert!(matches!(
            ctl.begin_share_upload("conn-unknown"),
            Err(RelayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn invalid_share_dump_is_rejected() {
        let (ctl, index) = controller();
        register(&ctl, "conn-1").await;
        let token = ctl.begin_share_upload("conn-1").unwrap();
        let credential = crypto::compute_credential(SECRET, AGENT, &token.to_string());
        assert!(ctl
            .handle_share_upload(token, AGENT, &credential, vec![], b"not json")
            .is_err());
        assert!(index.hosts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_drops_registration_and_host() {
        let (ctl, index) = controller();
        register(&ctl, "conn-1").await;
        let token = ctl.begin_share_upload("conn-1").unwrap();
        let credential = crypto::compute_credential(SECRET, AGENT, &token.to_string());
        let (shares, bytes) = dump();
        ctl.handle_share_upload(token, AGENT, &credential, shares, &bytes)
            .unwrap();

        ctl.handle_disconnect("conn-1").unwrap();
        assert!(ctl.registrations().unwrap().is_empty());
        assert!(index.hosts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_stream_happy_path() {
        let (ctl, _index) = controller();
        let channel = register(&ctl, "conn-1").await;
        let id = Uuid::new_v4();

        // The upload executor asks for the stream.
        let requester = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move {
                ctl.get_file_stream(AGENT, r"Music\x\y.mp3", 0, id, Duration::from_secs(10))
                    .await
            })
        };

        // The hub push goes out once the wait is registered.
        wait_for(|| {
            channel
                .log()
                .contains(&Pushed::FileUpload(r"Music\x\y.mp3".into(), 0, id))
        })
        .await;

        // The agent's HTTP upload arrives with the bytes.
        let handler = {
            let ctl = Arc::clone(&ctl);
            let credential = crypto::compute_credential(SECRET, AGENT, &id.to_string());
            tokio::spawn(async move {
                let body: AgentStream =
                    Box::pin(std::io::Cursor::new(vec![0xDE_u8, 0xAD, 0xBE, 0xEF]));
                ctl.handle_file_stream(id, AGENT, &credential, body).await
            })
        };

        // The executor gets exactly the agent's bytes.
        let mut stream = requester.await.unwrap().unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        // Closing the stream resolves the agent's upload normally.
        assert!(ctl.try_close_file_stream(AGENT, id, None));
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn file_stream_failure_propagates_and_burns_token() {
        let (ctl, _index) = controller();
        let channel = register(&ctl, "conn-1").await;
        let id = Uuid::new_v4();

        let requester = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move {
                ctl.get_file_stream(AGENT, r"Music\x\y.mp3", 0, id, Duration::from_secs(10))
                    .await
            })
        };
        wait_for(|| !channel.log().is_empty()).await;
        wait_for(|| {
            channel
                .log()
                .iter()
                .any(|p| matches!(p, Pushed::FileUpload(..)))
        })
        .await;

        // The agent cannot open the file.
        ctl.notify_file_stream_exception(id, "file missing").unwrap();
        match requester.await.unwrap() {
            Err(RelayError::RemoteAgent { message }) => assert_eq!(message, "file missing"),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("unexpected success"),
        }

        // The capability died with the failure: a late upload is refused.
        let credential = crypto::compute_credential(SECRET, AGENT, &id.to_string());
        let body: AgentStream = Box::pin(std::io::Cursor::new(vec![1_u8]));
        assert!(matches!(
            ctl.handle_file_stream(id, AGENT, &credential, body).await,
            Err(RelayError::Unauthorized)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn file_stream_timeout_releases_capability() {
        let (ctl, _index) = controller();
        register(&ctl, "conn-1").await;
        let id = Uuid::new_v4();

        let err = match ctl
            .get_file_stream(AGENT, r"Music\x\y.mp3", 0, id, Duration::from_millis(50))
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("unexpected success"),
        };
        assert!(matches!(err, RelayError::Timeout));

        // The capability was released on the timeout path.
        let credential = crypto::compute_credential(SECRET, AGENT, &id.to_string());
        let body: AgentStream = Box::pin(std::io::Cursor::new(vec![1_u8]));
        assert!(matches!(
            ctl.handle_file_stream(id, AGENT, &credential, body).await,
            Err(RelayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn aborted_transfer_unwinds_the_handler() {
        let (ctl, _index) = controller();
        let channel = register(&ctl, "conn-1").await;
        let id = Uuid::new_v4();

        let requester = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move {
                ctl.get_file_stream(AGENT, r"Music\x\y.mp3", 0, id, Duration::from_secs(10))
                    .await
            })
        };
        wait_for(|| {
            channel
                .log()
                .iter()
                .any(|p| matches!(p, Pushed::FileUpload(..)))
        })
        .await;

        let handler = {
            let ctl = Arc::clone(&ctl);
            let credential = crypto::compute_credential(SECRET, AGENT, &id.to_string());
            tokio::spawn(async move {
                let body: AgentStream = Box::pin(std::io::Cursor::new(vec![0_u8; 16]));
                ctl.handle_file_stream(id, AGENT, &credential, body).await
            })
        };
        let _stream = requester.await.unwrap().unwrap();

        // The peer-facing transfer fails; the agent's upload must fail
        // too, not report success.
        assert!(ctl.try_close_file_stream(AGENT, id, Some("peer hung up")));
        match handler.await.unwrap() {
            Err(RelayError::StreamAborted { message }) => assert_eq!(message, "peer hung up"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_info_round_trip() {
        let (ctl, _index) = controller();
        let channel = register(&ctl, "conn-1").await;
        let id = Uuid::new_v4();

        let probe = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move {
                ctl.get_file_info(AGENT, r"Music\x\y.mp3", id, Duration::from_secs(5))
                    .await
            })
        };
        wait_for(|| {
            channel
                .log()
                .iter()
                .any(|p| matches!(p, Pushed::FileInfo(..)))
        })
        .await;

        ctl.handle_file_info_response(AGENT, id, true, 4096).unwrap();
        assert_eq!(
            probe.await.unwrap().unwrap(),
            FileInfo {
                exists: true,
                length: 4096
            }
        );
    }

    #[tokio::test]
    async fn unsolicited_file_info_is_rejected() {
        let (ctl, _index) = controller();
        register(&ctl, "conn-1").await;
        let id = Uuid::new_v4();
        assert!(matches!(
            ctl.handle_file_info_response(AGENT, id, true, 1),
            Err(RelayError::UnsolicitedResponse { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn download_notifications_are_idempotent_until_expiry() {
        let (ctl, _index) = controller();
        let channel = register(&ctl, "conn-1").await;
        let id = Uuid::new_v4();

        ctl.notify_file_download_completed("music/a.mp3", id)
            .await
            .unwrap();
        assert!(channel
            .log()
            .contains(&Pushed::DownloadCompleted("music/a.mp3".into(), id)));

        // Validates any number of times inside the window.
        assert!(ctl.validate_download_notification("music/a.mp3", id));
        assert!(ctl.validate_download_notification("music/a.mp3", id));
        assert!(!ctl.validate_download_notification("music/other.mp3", id));

        tokio::time::advance(DOWNLOAD_NOTIFY_TTL + Duration::from_secs(1)).await;
        assert!(!ctl.validate_download_notification("music/a.mp3", id));
    }

    #[tokio::test]
    async fn stream_request_for_unknown_agent_fails() {
        let (ctl, _index) = controller();
        let err = match ctl
            .get_file_stream("ghost", "x", 0, Uuid::new_v4(), Duration::from_secs(1))
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("unexpected success"),
        };
        assert!(matches!(err, RelayError::UnknownAgent { .. }));
    }
}
