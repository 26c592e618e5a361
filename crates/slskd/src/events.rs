//! Daemon-wide event fan-out.
//!
//! Collaborator callbacks arrive in many shapes (watch channels, trait
//! callbacks, direct calls); one adapter normalises them into tagged
//! [`DaemonEvent`]s on a broadcast channel, so any number of consumers
//! can observe the daemon without each subsystem growing its own
//! subscriber list.

use tokio::sync::broadcast;

use slsk_connmgr::{ConnectionState, DisconnectCause};
use slsk_shares::IndexSummary;

/// Buffered events per subscriber; slow subscribers lose the oldest.
const EVENT_BUFFER: usize = 256;

/// Something notable that happened in the daemon.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DaemonEvent {
    /// The server connection changed state.
    ServerStateChanged(ConnectionState),
    /// The server connection dropped for the given cause.
    ServerDisconnected(DisconnectCause),
    /// The share index changed (host installed/removed, refresh done).
    SharesRefreshed(IndexSummary),
    /// The scheduler released an upload.
    UploadReleased {
        /// The requesting user.
        username: String,
        /// The released file.
        filename: String,
        /// The group whose slot it took.
        group: String,
    },
    /// A configuration reload was applied.
    ConfigReloaded {
        /// Number of changed leaves.
        changes: usize,
    },
    /// A relay agent registered with this controller.
    RelayAgentRegistered {
        /// The agent's name.
        name: String,
    },
    /// A relay agent went away.
    RelayAgentDeregistered {
        /// The agent's name.
        name: String,
    },
}

/// The daemon's broadcast bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    /// The broadcast sender.
    tx: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    /// Construct a bus.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUFFER);
        EventBus { tx }
    }

    /// Publish an event.  Events with no subscribers are dropped.
    pub fn publish(&self, event: DaemonEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(DaemonEvent::ConfigReloaded { changes: 2 });
        match rx.recv().await.unwrap() {
            DaemonEvent::ConfigReloaded { changes } => assert_eq!(changes, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(DaemonEvent::ServerStateChanged(ConnectionState::Connected));
    }
}
