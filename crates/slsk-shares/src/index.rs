//! The host table: who shares what, and how to ask.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use postage::watch;
use tracing::{debug, info};

use crate::err::ShareError;
use crate::filter::SearchFilter;
use crate::repository::{Share, ShareRepository, SharedFile};

/// The name of the local host.  Exactly one local host exists; every
/// other host is a relay agent, inserted on authentication and removed
/// on disconnect.
pub const LOCAL_HOST: &str = "local";

/// Tunables for the index's search behaviour.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct SharesConfig {
    /// Queries shorter than this return nothing.
    pub min_query_chars: usize,
    /// Upper bound on the number of files a search returns.
    pub max_search_results: usize,
    /// Usernames whose searches receive nothing.
    pub blacklisted_usernames: BTreeSet<String>,
}

impl Default for SharesConfig {
    fn default() -> Self {
        SharesConfig {
            min_query_chars: 3,
            max_search_results: 250,
            blacklisted_usernames: BTreeSet::new(),
        }
    }
}

/// An incoming search, as seen by the index.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SearchQuery<'a> {
    /// The raw query text.
    pub text: &'a str,
    /// The requesting username.
    pub username: &'a str,
}

impl<'a> SearchQuery<'a> {
    /// Construct a query.
    pub fn new(text: &'a str, username: &'a str) -> Self {
        SearchQuery { text, username }
    }
}

/// A summary of the index, published whenever its contents change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct IndexSummary {
    /// Bumped on every host installation or removal.
    pub generation: u64,
    /// Host names currently present.
    pub hosts: Vec<String>,
    /// Total files across all hosts.
    pub files: usize,
}

/// One host's binding in the index.
struct HostEntry {
    /// The share roots the host advertises.
    shares: Vec<Share>,
    /// The content store.
    repository: Arc<dyn ShareRepository>,
}

/// The shared-file index: an associative store keyed by host name.
///
/// Readers (search, resolve) take a cheap reader lock on the host table;
/// writers swap whole host bindings in and out under the writer lock.
/// Repository internals are immutable once installed, so readers never
/// contend with a scan in progress.
pub struct ShareIndex {
    /// Search tunables.
    config: SharesConfig,
    /// The host table.
    hosts: RwLock<HashMap<String, HostEntry>>,
    /// Whether a local refresh is in progress.  Guards the single-writer
    /// scan policy, not the host table.
    refreshing: Mutex<bool>,
    /// Publisher for [`IndexSummary`] updates.
    events: Mutex<watch::Sender<IndexSummary>>,
    /// Kept so subscribers can be minted at any time.
    events_rx: watch::Receiver<IndexSummary>,
}

impl ShareIndex {
    /// Construct an empty index.
    pub fn new(config: SharesConfig) -> Self {
        let (tx, rx) = watch::channel();
        ShareIndex {
            config,
            hosts: RwLock::new(HashMap::new()),
            refreshing: Mutex::new(false),
            events: Mutex::new(tx),
            events_rx: rx,
        }
    }

    /// Subscribe to index summaries.  The receiver yields the current
    /// summary immediately and an updated one after every change.
    pub fn subscribe(&self) -> watch::Receiver<IndexSummary> {
        self.events_rx.clone()
    }

    /// Install or replace the binding for `host` atomically.
    pub fn add_or_update_host(
        &self,
        host: impl Into<String>,
        shares: Vec<Share>,
        repository: Arc<dyn ShareRepository>,
    ) -> Result<(), ShareError> {
        let host = host.into();
        {
            let mut table = self.hosts.write().map_err(|_| ShareError::Poisoned)?;
            table.insert(host.clone(), HostEntry { shares, repository });
        }
        info!(host = %host, "share host installed");
        self.publish_summary()?;
        Ok(())
    }

    /// Remove the binding for `host`.  Returns true if it existed.
    pub fn remove_host(&self, host: &str) -> Result<bool, ShareError> {
        let removed = {
            let mut table = self.hosts.write().map_err(|_| ShareError::Poisoned)?;
            table.remove(host).is_some()
        };
        if removed {
            info!(host = %host, "share host removed");
            self.publish_summary()?;
        }
        Ok(removed)
    }

    /// The currently installed host names: local first, then remote
    /// hosts in name order.
    pub fn hosts(&self) -> Result<Vec<String>, ShareError> {
        let table = self.hosts.read().map_err(|_| ShareError::Poisoned)?;
        Ok(ordered_hosts(&table))
    }

    /// Map a virtual path to the host that owns it and the real path
    /// behind it.
    ///
    /// Hosts are consulted in deterministic order (local first, then by
    /// name); the first claimant wins.
    pub fn resolve(&self, filename: &str) -> Result<(String, String), ShareError> {
        let table = self.hosts.read().map_err(|_| ShareError::Poisoned)?;
        for host in ordered_hosts(&table) {
            // Host names in the ordering all come from the table.
            if let Some(entry) = table.get(&host) {
                if let Some(real) = entry.repository.resolve(filename) {
                    return Ok((host, real));
                }
            }
        }
        Err(ShareError::NotFound {
            filename: filename.to_owned(),
        })
    }

    /// Answer a search: the union of matching files across all hosts, in
    /// deterministic host order, capped at the configured maximum.
    ///
    /// Queries that are too short, queries with no include terms, and
    /// queries from blacklisted usernames return nothing.
    pub fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<SharedFile>, ShareError> {
        let text = query.text.trim();
        if text.chars().count() < self.config.min_query_chars {
            return Ok(Vec::new());
        }
        if self.config.blacklisted_usernames.contains(query.username) {
            debug!(username = %query.username, "ignoring search from blacklisted username");
            return Ok(Vec::new());
        }
        let filter = SearchFilter::parse(text);
        if !filter.has_include_terms() {
            return Ok(Vec::new());
        }

        let table = self.hosts.read().map_err(|_| ShareError::Poisoned)?;
        let mut results = Vec::new();
        for host in ordered_hosts(&table) {
            if results.len() >= self.config.max_search_results {
                break;
            }
            if let Some(entry) = table.get(&host) {
                let budget = self.config.max_search_results - results.len();
                results.extend(entry.repository.search(&filter, budget));
            }
        }
        Ok(results)
    }

    /// Begin a local share refresh.
    ///
    /// At most one refresh may be in progress; a concurrent attempt
    /// fails with [`ShareError::ScanAlreadyInProgress`].  The returned
    /// guard must be either [completed](RefreshGuard::complete) with the
    /// scan's product or dropped to abandon the refresh.
    pub fn begin_refresh(self: &Arc<Self>) -> Result<RefreshGuard, ShareError> {
        {
            let mut refreshing = self.refreshing.lock().map_err(|_| ShareError::Poisoned)?;
            if *refreshing {
                return Err(ShareError::ScanAlreadyInProgress);
            }
            *refreshing = true;
        }
        debug!("share refresh started");
        Ok(RefreshGuard {
            index: Arc::clone(self),
            done: false,
        })
    }

    /// Recompute and publish the index summary.
    fn publish_summary(&self) -> Result<(), ShareError> {
        let summary = {
            let table = self.hosts.read().map_err(|_| ShareError::Poisoned)?;
            let files = table.values().map(|e| e.repository.file_count()).sum();
            IndexSummary {
                generation: 0, // filled in below, under the sender lock
                hosts: ordered_hosts(&table),
                files,
            }
        };
        let mut sender = self.events.lock().map_err(|_| ShareError::Poisoned)?;
        let generation = sender.borrow().generation + 1;
        *sender.borrow_mut() = IndexSummary {
            generation,
            ..summary
        };
        Ok(())
    }

    /// The shares advertised by `host`, if installed.
    pub fn shares_of(&self, host: &str) -> Result<Option<Vec<Share>>, ShareError> {
        let table = self.hosts.read().map_err(|_| ShareError::Poisoned)?;
        Ok(table.get(host).map(|e| e.shares.clone()))
    }
}

/// Host names in deterministic order: local first, then by name.
fn ordered_hosts(table: &HashMap<String, HostEntry>) -> Vec<String> {
    let mut names: Vec<String> = table.keys().cloned().collect();
    names.sort_unstable_by(|a, b| {
        let a_local = a == LOCAL_HOST;
        let b_local = b == LOCAL_HOST;
        b_local.cmp(&a_local).then_with(|| a.cmp(b))
    });
    names
}

/// A token for an in-progress local share refresh.
///
/// Completing the guard installs the scan's product as the local host;
/// dropping it abandons the refresh.  Either way the single-writer slot
/// is released.
pub struct RefreshGuard {
    /// The index that handed this guard out.
    index: Arc<ShareIndex>,
    /// Set once the guard has been completed.
    done: bool,
}

impl RefreshGuard {
    /// Install the product of the scan as the local host binding.
    pub fn complete(
        mut self,
        shares: Vec<Share>,
        repository: Arc<dyn ShareRepository>,
    ) -> Result<(), ShareError> {
        repository.try_validate()?;
        self.index
            .add_or_update_host(LOCAL_HOST, shares, repository)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if !self.done {
            debug!("share refresh abandoned");
        }
        if let Ok(mut refreshing) = self.index.refreshing.lock() {
            *refreshing = false;
        }
    }
}
