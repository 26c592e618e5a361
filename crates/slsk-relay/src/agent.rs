//! The agent half of the relay.
//!
//! An agent maintains one authenticated hub connection to its
//! controller (reconnecting on a fixed step schedule), answers the
//! controller's challenge, uploads its shares exactly once per session,
//! and then services whatever the controller asks of it: file streams
//! over the side channel, file-info probes over the hub.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use slsk_basic_utils::StepSchedule;
use slsk_error::ErrorReport as _;
use slsk_shares::{Share, ShareIndex, LOCAL_HOST};

use crate::controller::AgentStream;
use crate::crypto;
use crate::err::RelayError;

/// Agent-side relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct RelayAgentConfig {
    /// This instance's name, as the controller knows it.
    pub instance_name: String,
    /// The secret shared with the controller.
    pub secret: String,
}

/// The agent's view of its controller.
///
/// Implemented by the hub + HTTP transport; the agent never sees
/// transport types.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// Establish the hub connection.  Challenges and requests then
    /// arrive as [`AgentEvent`]s.
    async fn connect(&self) -> Result<(), RelayError>;

    /// Answer the controller's challenge.  Returns whether the
    /// controller accepted the credential.
    async fn login(&self, agent_name: &str, credential: &str) -> Result<bool, RelayError>;

    /// Ask for a share-upload capability token.
    async fn begin_share_upload(&self) -> Result<Uuid, RelayError>;

    /// Deliver the shares and serialized repository over the side
    /// channel.
    async fn upload_shares(
        &self,
        token: Uuid,
        agent_name: &str,
        credential: &str,
        shares: Vec<Share>,
        repository_dump: Vec<u8>,
    ) -> Result<(), RelayError>;

    /// Deliver a requested file's bytes over the side channel.  The
    /// call resolves when the controller's transfer is finished with
    /// the stream.
    async fn upload_file_stream(
        &self,
        id: Uuid,
        agent_name: &str,
        credential: &str,
        stream: AgentStream,
    ) -> Result<(), RelayError>;

    /// Answer a file-info probe over the hub.
    async fn return_file_info(&self, id: Uuid, exists: bool, length: u64)
        -> Result<(), RelayError>;

    /// Report that a requested file upload cannot be serviced.
    async fn notify_file_upload_failed(&self, id: Uuid) -> Result<(), RelayError>;
}

/// Something the controller pushed to us over the hub, normalised by
/// the transport into plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AgentEvent {
    /// An authentication challenge for a fresh connection.
    Challenge {
        /// The one-shot challenge token.
        auth_token: String,
    },
    /// The controller wants a file's bytes.
    RequestFileUpload {
        /// Virtual path of the file.
        filename: String,
        /// Offset to start from.
        start_offset: u64,
        /// Correlates the side-channel upload with the request.
        id: Uuid,
    },
    /// The controller wants to know whether we have a file.
    RequestFileInfo {
        /// Virtual path of the file.
        filename: String,
        /// Correlates the answer with the probe.
        id: Uuid,
    },
    /// A download completed on the controller.
    DownloadCompleted {
        /// Path of the downloaded file, relative to the download root.
        relative_path: String,
        /// The notification's idempotency token.
        id: Uuid,
    },
    /// The hub connection dropped.
    Disconnected,
}

/// The agent's local file storage.
pub trait FileStore: Send + Sync {
    /// Open a file for reading from the given offset.
    fn open(&self, real_path: &str, start_offset: u64) -> Result<AgentStream, RelayError>;

    /// The file's length in bytes, if it exists.
    fn length(&self, real_path: &str) -> Option<u64>;

    /// Export the local shares and the serialized repository for
    /// delivery to the controller.
    fn export(&self) -> Result<(Vec<Share>, Vec<u8>), RelayError>;
}

/// The relay agent.
pub struct RelayAgent {
    /// Name and secret.
    config: RelayAgentConfig,
    /// The transport to the controller.
    client: Arc<dyn ControllerClient>,
    /// The local share index, for resolving requested virtual paths.
    index: Arc<ShareIndex>,
    /// The local file storage.
    files: Arc<dyn FileStore>,
    /// Process-wide shutdown.
    shutdown: CancellationToken,
}

impl RelayAgent {
    /// Construct an agent.
    pub fn new(
        config: RelayAgentConfig,
        client: Arc<dyn ControllerClient>,
        index: Arc<ShareIndex>,
        files: Arc<dyn FileStore>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(RelayAgent {
            config,
            client,
            index,
            files,
            shutdown,
        })
    }

    /// Run the agent until shutdown.
    ///
    /// `events` carries everything the controller pushes over the hub,
    /// as normalised by the transport.  Connection loss re-enters the
    /// connect loop on the step schedule `0, 1s, 3s, 10s, 30s, 30s, …`.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<AgentEvent>) {
        let mut schedule = StepSchedule::agent_reconnect();
        'reconnect: loop {
            let delay = schedule.next_delay();
            if !delay.is_zero() {
                info!(delay_ms = delay.as_millis() as u64, "waiting before hub reconnect");
            }
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown.cancelled() => return,
            }

            match self.client.connect().await {
                Ok(()) => {
                    info!("hub connected");
                    schedule.reset();
                }
                Err(e) => {
                    debug!("hub connect failed: {}", e.report());
                    continue 'reconnect;
                }
            }

            // Shares are uploaded exactly once per session, after the
            // first successful login.
            let mut shares_uploaded = false;
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    () = self.shutdown.cancelled() => return,
                };
                let Some(event) = event else {
                    // Transport dropped its sender: nothing more will
                    // ever arrive.
                    return;
                };
                match event {
                    AgentEvent::Challenge { auth_token } => {
                        self.handle_challenge(&auth_token, &mut shares_uploaded).await;
                    }
                    AgentEvent::RequestFileUpload {
                        filename,
                        start_offset,
                        id,
                    } => {
                        // Uploads are serviced concurrently; a slow disk
                        // must not stall the hub event loop.
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            this.handle_file_upload(&filename, start_offset, id).await;
                        });
                    }
                    AgentEvent::RequestFileInfo { filename, id } => {
                        self.handle_file_info(&filename, id).await;
                    }
                    AgentEvent::DownloadCompleted { relative_path, id } => {
                        debug!(path = %relative_path, %id, "download completed on controller");
                    }
                    AgentEvent::Disconnected => {
                        warn!("hub connection lost");
                        continue 'reconnect;
                    }
                }
            }
        }
    }

    /// Answer a challenge; upload shares after the first accepted login
    /// of the session.
    async fn handle_challenge(&self, auth_token: &str, shares_uploaded: &mut bool) {
        let credential =
            crypto::compute_credential(&self.config.secret, &self.config.instance_name, auth_token);
        match self
            .client
            .login(&self.config.instance_name, &credential)
            .await
        {
            Ok(true) => {
                info!("logged in to controller");
                if !*shares_uploaded {
                    match self.upload_shares().await {
                        Ok(()) => *shares_uploaded = true,
                        Err(e) => warn!("share upload failed: {}", e.report()),
                    }
                }
            }
            Ok(false) => warn!("controller rejected login"),
            Err(e) => warn!("login failed: {}", e.report()),
        }
    }

    /// Obtain a share-upload token and deliver our shares.
    async fn upload_shares(&self) -> Result<(), RelayError> {
        let (shares, dump) = self.files.export()?;
        let token = self.client.begin_share_upload().await?;
        let credential = crypto::compute_credential(
            &self.config.secret,
            &self.config.instance_name,
            &token.to_string(),
        );
        self.client
            .upload_shares(
                token,
                &self.config.instance_name,
                &credential,
                shares,
                dump,
            )
            .await?;
        info!("shares uploaded to controller");
        Ok(())
    }

    /// Service one file-upload request.
    async fn handle_file_upload(&self, filename: &str, start_offset: u64, id: Uuid) {
        let stream = self
            .index
            .resolve(filename)
            .map_err(RelayError::from_resolve(filename))
            .and_then(|(host, real_path)| {
                if host == LOCAL_HOST {
                    self.files.open(&real_path, start_offset)
                } else {
                    Err(RelayError::NoSuchFile {
                        filename: filename.to_owned(),
                    })
                }
            });
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%id, file = %filename, "cannot service upload: {}", e.report());
                if let Err(e) = self.client.notify_file_upload_failed(id).await {
                    warn!(%id, "failed to report upload failure: {}", e.report());
                }
                return;
            }
        };

        let credential = crypto::compute_credential(
            &self.config.secret,
            &self.config.instance_name,
            &id.to_string(),
        );
        debug!(%id, file = %filename, start_offset, "uploading file stream");
        if let Err(e) = self
            .client
            .upload_file_stream(id, &self.config.instance_name, &credential, stream)
            .await
        {
            warn!(%id, "file stream upload failed: {}", e.report());
        }
    }

    /// Answer one file-info probe.
    async fn handle_file_info(&self, filename: &str, id: Uuid) {
        let (exists, length) = match self.index.resolve(filename) {
            Ok((host, real_path)) if host == LOCAL_HOST => {
                match self.files.length(&real_path) {
                    Some(length) => (true, length),
                    None => (false, 0),
                }
            }
            _ => (false, 0),
        };
        if let Err(e) = self.client.return_file_info(id, exists, length).await {
            warn!(%id, "failed to return file info: {}", e.report());
        }
    }
}

impl RelayError {
    /// Adapter turning a share-index resolution failure into a
    /// [`RelayError::NoSuchFile`] for the given filename.
    fn from_resolve(filename: &str) -> impl FnOnce(slsk_shares::ShareError) -> RelayError + '_ {
        move |_| RelayError::NoSuchFile {
            filename: filename.to_owned(),
        }
    }
}
