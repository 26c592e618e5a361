//! Observable application state.
//!
//! The daemon's externally visible condition is one immutable snapshot,
//! published over a watch channel.  Anything that wants to render it (a
//! control surface, a status line, a test) subscribes and receives a
//! fresh snapshot whenever something actually changed; updates that
//! produce an identical snapshot are swallowed.

use std::sync::Mutex;

use postage::watch;

use slsk_async_utils::WatchSenderExt as _;
use slsk_config::ReloadState;
use slsk_connmgr::ConnectionState;
use slsk_shares::IndexSummary;

/// A generic only-on-change snapshot cell.
pub struct StateStore<T> {
    /// The publishing half, serialised behind a lock.
    tx: Mutex<watch::Sender<T>>,
    /// Kept so subscribers can be minted at any time.
    rx: watch::Receiver<T>,
}

impl<T> StateStore<T>
where
    T: Clone + PartialEq + Default,
{
    /// Construct a store holding `T::default()`.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel();
        StateStore {
            tx: Mutex::new(tx),
            rx,
        }
    }

    /// The current snapshot.
    pub fn read(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Subscribe to snapshots.  The receiver yields the current value
    /// immediately and a new one after every effective update.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }

    /// Apply `update` to a copy of the current snapshot and publish the
    /// result if it differs.
    pub fn update(&self, update: impl FnOnce(&mut T)) {
        let mut tx = match self.tx.lock() {
            Ok(tx) => tx,
            Err(poisoned) => poisoned.into_inner(),
        };
        tx.edit(update);
    }
}

impl<T: Clone + PartialEq + Default> Default for StateStore<T> {
    fn default() -> Self {
        StateStore::new()
    }
}

/// Upload scheduler counters, as shown in the application state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct UploadsSummary {
    /// Uploads waiting for a slot.
    pub queued: usize,
    /// Uploads currently running.
    pub started: usize,
    /// Rolling average upload speed, bytes per second.
    pub average_speed: u64,
}

/// The daemon's externally visible condition.
#[derive(Debug, Clone, Default, PartialEq)]
#[non_exhaustive]
pub struct ApplicationState {
    /// The daemon's version string.
    pub version: String,
    /// The server connection.
    pub server: ConnectionState,
    /// Configuration reload outcome (pending restart/reconnect).
    pub reload: ReloadState,
    /// The share index.
    pub shares: IndexSummary,
    /// The upload scheduler.
    pub uploads: UploadsSummary,
    /// Names of currently registered relay agents.
    pub relay_agents: Vec<String>,
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use futures::StreamExt as _;

    #[tokio::test]
    async fn updates_publish_only_on_change() {
        let store: StateStore<ApplicationState> = StateStore::new();
        let mut rx = store.subscribe();
        assert_eq!(rx.next().await.unwrap(), ApplicationState::default());

        // An update that changes nothing publishes nothing.
        store.update(|_| {});
        // An effective update publishes the new snapshot.
        store.update(|s| s.uploads.queued = 3);
        let got = rx.next().await.unwrap();
        assert_eq!(got.uploads.queued, 3);
        assert_eq!(store.read().uploads.queued, 3);
    }
}
