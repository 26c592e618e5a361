//! The connection watchdog.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use postage::watch;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use slsk_async_utils::WatchSenderExt as _;
use slsk_basic_utils::ExponentialBackoff;
use slsk_error::{ErrorKind, HasKind};

/// Why a server connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectCause {
    /// The process is shutting down.
    ShuttingDown,
    /// The daemon disconnected on purpose.
    IntentionalDisconnect,
    /// The server rejected our login.
    LoginRejected,
    /// The server kicked this session (usually a second login elsewhere).
    KickedFromServer,
    /// The connection was lost for some transport-level reason.
    ConnectionLost(String),
}

impl DisconnectCause {
    /// True for causes that must never trigger a reconnect and should be
    /// surfaced at error level.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DisconnectCause::LoginRejected | DisconnectCause::KickedFromServer
        )
    }

    /// True for disconnects the daemon itself asked for.
    pub fn is_intentional(&self) -> bool {
        matches!(
            self,
            DisconnectCause::ShuttingDown | DisconnectCause::IntentionalDisconnect
        )
    }
}

/// An error from one connection attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectError {
    /// The server rejected the configured credentials.
    #[error("server rejected login")]
    LoginRejected,

    /// No credentials are configured.
    #[error("no credentials configured")]
    MissingCredentials,

    /// The attempt failed for a transport-level reason; retriable.
    #[error("connection attempt failed: {0}")]
    Transport(String),
}

impl HasKind for ConnectError {
    fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::LoginRejected => ErrorKind::Unauthorized,
            ConnectError::MissingCredentials => ErrorKind::ValidationFailed,
            ConnectError::Transport(_) => ErrorKind::PeerProtocol,
        }
    }
}

/// An error from driving the watchdog itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum WatchdogError {
    /// The watchdog's lock was poisoned.  This indicates a bug.
    #[error("watchdog poisoned")]
    Poisoned,
}

impl HasKind for WatchdogError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// The watchdog's externally visible state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionState {
    /// Not connected and not trying to be.
    #[default]
    Stopped,
    /// Between attempts, or an attempt is in flight.
    Connecting,
    /// Connected and logged in.
    Connected,
}

/// The server connection, as the watchdog sees it.
///
/// The peer-protocol client implements this; the watchdog owns *when* to
/// connect, the endpoint owns *how*.
#[async_trait]
pub trait ServerEndpoint: Send + Sync {
    /// Make one connection attempt, including login.  Must not retry
    /// internally; the watchdog owns the retry policy.
    async fn connect(&self) -> Result<(), ConnectError>;

    /// Wait until the current connection ends, and say why.
    async fn disconnected(&self) -> DisconnectCause;

    /// Tear the current connection down with the given cause.
    async fn disconnect(&self, cause: DisconnectCause);
}

/// State shared between the watchdog handle and its supervisor task.
struct WatchdogInner {
    /// Whether a supervisor task is running.
    running: bool,
    /// Cancelled to short-circuit the backoff delay currently in
    /// progress, if any.
    nudge: Option<CancellationToken>,
}

/// A supervisor that keeps the server connection alive.
///
/// `start` brings the connection up and re-establishes it after
/// unexpected disconnects, backing off exponentially (capped, jittered)
/// between failed attempts.  Intentional disconnects and fatal causes
/// (`LoginRejected`, `KickedFromServer`) park the watchdog in `Stopped`.
pub struct ConnectionWatchdog {
    /// The connection itself.
    endpoint: Arc<dyn ServerEndpoint>,
    /// Supervisor bookkeeping.
    inner: Mutex<WatchdogInner>,
    /// State publisher.
    state_tx: Mutex<watch::Sender<ConnectionState>>,
    /// Kept so subscribers can be minted at any time.
    state_rx: watch::Receiver<ConnectionState>,
    /// Publisher for disconnect causes.  `None` until the first
    /// disconnect; every disconnect is published, even a repeat of the
    /// previous cause.
    causes_tx: Mutex<watch::Sender<Option<DisconnectCause>>>,
    /// Kept so subscribers can be minted at any time.
    causes_rx: watch::Receiver<Option<DisconnectCause>>,
    /// Fired once at process shutdown.
    shutdown: CancellationToken,
}

impl ConnectionWatchdog {
    /// Construct a watchdog over the given endpoint.
    ///
    /// `shutdown` is the process-wide cancellation token; when it fires
    /// the supervisor task exits without reconnecting.
    pub fn new(endpoint: Arc<dyn ServerEndpoint>, shutdown: CancellationToken) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel();
        let (causes_tx, causes_rx) = watch::channel();
        Arc::new(ConnectionWatchdog {
            endpoint,
            inner: Mutex::new(WatchdogInner {
                running: false,
                nudge: None,
            }),
            state_tx: Mutex::new(state_tx),
            state_rx,
            causes_tx: Mutex::new(causes_tx),
            causes_rx,
            shutdown,
        })
    }

    /// The current state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to disconnect causes.
    ///
    /// The receiver yields `None` until the first disconnect, then the
    /// cause of each disconnect as it happens.
    pub fn subscribe_disconnects(&self) -> watch::Receiver<Option<DisconnectCause>> {
        self.causes_rx.clone()
    }

    /// Publish a state.  Re-entering the same state (retry loops pass
    /// through `Connecting` repeatedly) does not wake subscribers.
    fn set_state(&self, state: ConnectionState) -> Result<(), WatchdogError> {
        let mut tx = self.state_tx.lock().map_err(|_| WatchdogError::Poisoned)?;
        tx.send_if_changed(state);
        Ok(())
    }

    /// Publish a disconnect cause.  Unlike states, every disconnect is
    /// an event of its own, so this always wakes subscribers.
    fn record_disconnect(&self, cause: DisconnectCause) {
        if let Ok(mut tx) = self.causes_tx.lock() {
            *tx.borrow_mut() = Some(cause);
        }
    }

    /// Start supervising, if not already doing so.
    ///
    /// Idempotent: calling `start` while the watchdog is `Connecting`
    /// behaves like [`restart`](Self::restart) and short-circuits any
    /// backoff delay in progress.
    pub fn start(self: &Arc<Self>) -> Result<(), WatchdogError> {
        {
            let mut inner = self.inner.lock().map_err(|_| WatchdogError::Poisoned)?;
            if inner.running {
                drop(inner);
                return self.restart();
            }
            inner.running = true;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run().await;
            if let Ok(mut inner) = this.inner.lock() {
                inner.running = false;
                inner.nudge = None;
            }
            let _ = this.set_state(ConnectionState::Stopped);
        });
        Ok(())
    }

    /// Short-circuit the backoff delay currently in progress, if any.
    ///
    /// Useful when an operator does not feel like waiting out a long
    /// delay.  Has no effect unless the watchdog is between attempts.
    pub fn restart(&self) -> Result<(), WatchdogError> {
        let inner = self.inner.lock().map_err(|_| WatchdogError::Poisoned)?;
        if let Some(nudge) = &inner.nudge {
            debug!("short-circuiting reconnect delay");
            nudge.cancel();
        }
        Ok(())
    }

    /// Disconnect and park.
    ///
    /// The disconnect is issued with an intentional cause, so the
    /// supervisor loop sees it and does not reconnect.
    pub async fn stop(&self) {
        self.endpoint
            .disconnect(DisconnectCause::IntentionalDisconnect)
            .await;
    }

    /// The supervisor loop.
    async fn run(self: &Arc<Self>) {
        let mut backoff = ExponentialBackoff::default();
        loop {
            let _ = self.set_state(ConnectionState::Connecting);

            let delay = backoff.next_delay(&mut rand::rng());
            if !delay.is_zero() {
                info!(delay_ms = delay.as_millis() as u64, "waiting before reconnect attempt");
                let nudge = CancellationToken::new();
                if let Ok(mut inner) = self.inner.lock() {
                    inner.nudge = Some(nudge.clone());
                }
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = nudge.cancelled() => {}
                    () = self.shutdown.cancelled() => return,
                }
                if let Ok(mut inner) = self.inner.lock() {
                    inner.nudge = None;
                }
            }
            if self.shutdown.is_cancelled() {
                return;
            }

            match self.endpoint.connect().await {
                Ok(()) => {
                    backoff.reset();
                    info!("connected to server");
                    let _ = self.set_state(ConnectionState::Connected);

                    let cause = tokio::select! {
                        cause = self.endpoint.disconnected() => cause,
                        () = self.shutdown.cancelled() => return,
                    };
                    self.record_disconnect(cause.clone());
                    if cause.is_fatal() {
                        error!(?cause, "disconnected from server; not reconnecting");
                        return;
                    }
                    if cause.is_intentional() {
                        info!(?cause, "disconnected from server");
                        return;
                    }
                    warn!(?cause, "unexpectedly disconnected from server; reconnecting");
                }
                Err(ConnectError::LoginRejected) => {
                    error!("server rejected login; not reconnecting");
                    self.record_disconnect(DisconnectCause::LoginRejected);
                    return;
                }
                Err(ConnectError::MissingCredentials) => {
                    warn!("no credentials configured; not connecting");
                    return;
                }
                Err(ConnectError::Transport(reason)) => {
                    debug!(%reason, attempt = backoff.iteration(), "connection attempt failed");
                }
            }
        }
    }
}
