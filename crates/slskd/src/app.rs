//! Wiring the subsystems into one daemon.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use slsk_config::{
    ConfigError, OptionDiff, Options, ReconfigurableModule, ReconfigureStatus, ReloadPlane,
    SoulseekPatch,
};
use slsk_connmgr::ConnectionWatchdog;
use slsk_error::ErrorReport as _;
use slsk_relay::{RelayAgentCredentials, RelayController, RelayControllerConfig};
use slsk_search::{
    ResolverConfig, SearchResolver, SearchService, SearchStore, UploadCapacity,
};
use slsk_shares::ShareIndex;
use slsk_transfers::{UploadQueue, LEECHERS_GROUP};

use crate::events::{DaemonEvent, EventBus};
use crate::logging::LogBuffer;
use crate::peer::PeerClients;
use crate::state::{ApplicationState, StateStore, UploadsSummary};

/// How often the scheduler is nudged even when nothing signalled it.
const PROCESS_INTERVAL: Duration = Duration::from_secs(1);

/// The resolver's view of the upload queue.
struct QueueCapacity {
    /// The queue.
    queue: Arc<UploadQueue>,
}

impl UploadCapacity for QueueCapacity {
    fn has_free_slot(&self) -> bool {
        self.queue
            .snapshot()
            .map(|s| s.has_free_slot_excluding(&[LEECHERS_GROUP]))
            .unwrap_or(false)
    }

    fn queue_length(&self) -> usize {
        self.queue.snapshot().map(|s| s.queued).unwrap_or(0)
    }

    fn average_speed(&self) -> u64 {
        self.queue.snapshot().map(|s| s.average_speed).unwrap_or(0)
    }
}

/// Applies `groups.*` changes to the live scheduler.
struct SchedulerModule {
    /// The queue to reconfigure.
    queue: Arc<UploadQueue>,
}

impl ReconfigurableModule for SchedulerModule {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn reconfigure(
        &self,
        new: &Arc<Options>,
        diff: &[OptionDiff],
    ) -> Result<ReconfigureStatus, ConfigError> {
        if diff
            .iter()
            .any(|d| d.path == "groups" || d.path.starts_with("groups."))
        {
            self.queue
                .reconfigure(&new.groups)
                .map_err(|e| ConfigError::Rejected {
                    module: "scheduler".to_owned(),
                    reason: e.to_string(),
                })?;
        }
        Ok(ReconfigureStatus::default())
    }
}

/// Collects `soulseek.*` changes into the peer-client patch.
///
/// The patch is applied by the wire client; until it reports otherwise,
/// any soulseek-scoped change is assumed to need a server reconnect.
struct SoulseekModule;

impl ReconfigurableModule for SoulseekModule {
    fn name(&self) -> &'static str {
        "soulseek-client"
    }

    fn reconfigure(
        &self,
        new: &Arc<Options>,
        diff: &[OptionDiff],
    ) -> Result<ReconfigureStatus, ConfigError> {
        let patch = SoulseekPatch::from_diffs(diff, new);
        let mut status = ReconfigureStatus::default();
        status.pending_reconnect = !patch.is_empty();
        Ok(status)
    }
}

/// The assembled daemon.
pub struct Daemon {
    /// The hot-reload plane (owns the running options snapshot).
    plane: Arc<ReloadPlane>,
    /// The shared-file index.
    index: Arc<ShareIndex>,
    /// The upload scheduler.
    queue: Arc<UploadQueue>,
    /// Answers remote searches.
    resolver: Arc<SearchResolver>,
    /// Drives outgoing searches.
    searches: Arc<SearchService>,
    /// Supervises the server connection.
    watchdog: Arc<ConnectionWatchdog>,
    /// The relay controller, when running in controller mode.
    relay_controller: Option<Arc<RelayController>>,
    /// Observable application state.
    state: Arc<StateStore<ApplicationState>>,
    /// Daemon-wide event fan-out.
    events: EventBus,
    /// Recent log events.
    log_buffer: Arc<LogBuffer>,
    /// Keeps the reconfigurable modules alive (the plane holds weaks).
    _modules: Vec<Arc<dyn ReconfigurableModule>>,
    /// Whether credentials exist to connect with.
    have_credentials: bool,
    /// Process-wide shutdown.
    shutdown: CancellationToken,
}

impl Daemon {
    /// Assemble a daemon from options and peer-protocol collaborators.
    pub fn new(
        options: Arc<Options>,
        clients: PeerClients,
        log_buffer: Arc<LogBuffer>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        options.validate().context("invalid configuration")?;

        let index = Arc::new(ShareIndex::new(options.shares.clone()));
        let queue = Arc::new(UploadQueue::new(&options.groups, clients.users));
        let mut resolver_config = ResolverConfig::default();
        resolver_config.max_files_per_response = options.shares.max_search_results;
        let resolver = Arc::new(SearchResolver::new(
            Arc::clone(&index),
            Arc::new(QueueCapacity {
                queue: Arc::clone(&queue),
            }),
            resolver_config,
        ));

        let store = if options.searches_database.is_empty() {
            SearchStore::open_in_memory()
        } else {
            SearchStore::open(&options.searches_database)
        }
        .context("cannot open the searches database")?;
        let searches = SearchService::new(Arc::new(store), clients.search);

        let watchdog = ConnectionWatchdog::new(clients.server, shutdown.clone());

        let relay_controller = match options.relay.mode {
            slsk_config::RelayMode::Controller => {
                let config = RelayControllerConfig {
                    agents: options
                        .relay
                        .controller
                        .agents
                        .iter()
                        .map(|a| RelayAgentCredentials {
                            name: a.name.clone(),
                            secret: a.secret.as_inner().clone(),
                        })
                        .collect(),
                };
                Some(RelayController::new(config, Arc::clone(&index)))
            }
            slsk_config::RelayMode::Agent => {
                // The agent half needs a hub transport to the
                // controller, which plugs in the way the peer client
                // does; without one there is nothing to run.
                info!("relay agent mode configured; waiting for a hub transport");
                None
            }
            slsk_config::RelayMode::Disabled => None,
            _ => None,
        };

        let have_credentials = options.soulseek.username.is_some()
            && options.soulseek.password.is_some();

        let plane = Arc::new(ReloadPlane::new(Arc::clone(&options)));
        let modules: Vec<Arc<dyn ReconfigurableModule>> = vec![
            Arc::new(SchedulerModule {
                queue: Arc::clone(&queue),
            }),
            Arc::new(SoulseekModule),
        ];
        for module in &modules {
            plane
                .register(Arc::downgrade(module) as Weak<dyn ReconfigurableModule>)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }

        let state = Arc::new(StateStore::new());
        state.update(|s: &mut ApplicationState| {
            s.version = env!("CARGO_PKG_VERSION").to_owned();
        });

        Ok(Arc::new(Daemon {
            plane,
            index,
            queue,
            resolver,
            searches,
            watchdog,
            relay_controller,
            state,
            events: EventBus::new(),
            log_buffer,
            _modules: modules,
            have_credentials,
            shutdown,
        }))
    }

    /// Run until shutdown, then disconnect gracefully.
    pub async fn run(self: &Arc<Self>) {
        self.spawn_adapters();

        if self.have_credentials {
            if let Err(e) = self.watchdog.start() {
                warn!("cannot start the connection watchdog: {}", e.report());
            }
        } else {
            info!("no soulseek credentials configured; staying offline");
        }

        self.shutdown.cancelled().await;

        // Disconnect with an intentional cause so the watchdog parks
        // instead of reconnecting under us.
        self.watchdog.stop().await;
    }

    /// Spawn the adapter tasks that normalise collaborator callbacks
    /// into state updates and daemon events.
    fn spawn_adapters(self: &Arc<Self>) {
        // Server connection state.
        {
            let this = Arc::clone(self);
            let mut states = self.watchdog.subscribe();
            tokio::spawn(async move {
                while let Some(server) = states.next().await {
                    this.state.update(|s| s.server = server);
                    this.events.publish(DaemonEvent::ServerStateChanged(server));
                }
            });
        }

        // Disconnect causes.
        {
            let this = Arc::clone(self);
            let mut causes = self.watchdog.subscribe_disconnects();
            tokio::spawn(async move {
                while let Some(cause) = causes.next().await {
                    if let Some(cause) = cause {
                        this.events.publish(DaemonEvent::ServerDisconnected(cause));
                    }
                }
            });
        }

        // Share index summaries.
        {
            let this = Arc::clone(self);
            let mut summaries = self.index.subscribe();
            tokio::spawn(async move {
                while let Some(summary) = summaries.next().await {
                    this.state.update(|s| s.shares = summary.clone());
                    this.events.publish(DaemonEvent::SharesRefreshed(summary));
                }
            });
        }

        // Reload outcomes.
        {
            let this = Arc::clone(self);
            let mut reloads = self.plane.subscribe();
            tokio::spawn(async move {
                while let Some(reload) = reloads.next().await {
                    this.state.update(|s| s.reload = reload);
                }
            });
        }

        // The scheduler pump: release whatever is releasable, then
        // refresh the upload counters.
        {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(PROCESS_INTERVAL);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {}
                        () = this.shutdown.cancelled() => return,
                    }
                    loop {
                        match this.queue.process() {
                            Ok(Some(released)) => {
                                this.events.publish(DaemonEvent::UploadReleased {
                                    username: released.username,
                                    filename: released.filename,
                                    group: released.group,
                                });
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("scheduler pump failed: {}", e.report());
                                break;
                            }
                        }
                    }
                    if let Ok(snapshot) = this.queue.snapshot() {
                        this.state.update(|s| {
                            s.uploads = UploadsSummary {
                                queued: snapshot.queued,
                                started: snapshot.started,
                                average_speed: snapshot.average_speed,
                            };
                        });
                    }
                    if let Some(controller) = &this.relay_controller {
                        if let Ok(regs) = controller.registrations() {
                            let names: Vec<String> =
                                regs.iter().map(|r| r.name.clone()).collect();
                            let previous = this.state.read().relay_agents;
                            for name in names.iter().filter(|n| !previous.contains(n)) {
                                this.events.publish(DaemonEvent::RelayAgentRegistered {
                                    name: name.clone(),
                                });
                            }
                            for name in previous.iter().filter(|n| !names.contains(n)) {
                                this.events.publish(DaemonEvent::RelayAgentDeregistered {
                                    name: name.clone(),
                                });
                            }
                            this.state.update(|s| s.relay_agents = names);
                        }
                    }
                }
            });
        }
    }

    /// Apply a new configuration snapshot.
    pub fn reconfigure(&self, new: Arc<Options>) -> Result<usize, ConfigError> {
        let diffs = self.plane.reconfigure(new)?;
        if !diffs.is_empty() {
            self.events.publish(DaemonEvent::ConfigReloaded {
                changes: diffs.len(),
            });
        }
        Ok(diffs.len())
    }

    /// The observable application state.
    pub fn state(&self) -> &StateStore<ApplicationState> {
        &self.state
    }

    /// The daemon event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The shared-file index.
    pub fn index(&self) -> &Arc<ShareIndex> {
        &self.index
    }

    /// The upload scheduler.
    pub fn queue(&self) -> &Arc<UploadQueue> {
        &self.queue
    }

    /// The search resolver.
    pub fn resolver(&self) -> &Arc<SearchResolver> {
        &self.resolver
    }

    /// The outgoing-search service.
    pub fn searches(&self) -> &Arc<SearchService> {
        &self.searches
    }

    /// The connection watchdog.
    pub fn watchdog(&self) -> &Arc<ConnectionWatchdog> {
        &self.watchdog
    }

    /// The relay controller, when running in controller mode.
    pub fn relay_controller(&self) -> Option<&Arc<RelayController>> {
        self.relay_controller.as_ref()
    }

    /// Recent log events.
    pub fn recent_logs(&self, n: usize) -> Vec<crate::logging::LogEntry> {
        self.log_buffer.recent(n)
    }
}
