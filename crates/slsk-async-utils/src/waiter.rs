//! A keyed registry of one-shot futures.
//!
//! Request/response flows in the daemon frequently cross transport
//! boundaries: a request goes out over one channel (say, the relay hub)
//! and its answer arrives over another (an HTTP handler, a different hub
//! callback).  The [`Waiter`] is the rendezvous point for those flows:
//! one task registers a wait under a [`WaitKey`] and suspends on the
//! returned future; another task later *completes* (or *fails*) that key,
//! resuming the first task with a value or an error.
//!
//! Each key maps to at most one outstanding future.  Completion removes
//! the registration before the waiter is resumed, so a continuation may
//! immediately register a fresh wait under the same key.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use slsk_error::{ErrorKind, HasKind};

use crate::oneshot;

/// An ordered tuple of strings identifying one pending rendezvous.
///
/// Keys are usually built from an operation name plus the identifiers
/// that scope it, e.g. `("file_stream", agent_name, request_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitKey {
    /// The parts of the key, in order.
    parts: Vec<String>,
}

impl WaitKey {
    /// Construct a key from an ordered sequence of parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WaitKey {
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }
}

impl Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts.join(":"))
    }
}

/// An error resulting from a [`Waiter`] operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum WaitError {
    /// A wait was requested for a key that already has an outstanding future.
    #[error("a wait is already registered for this key")]
    AlreadyPending,

    /// The wait was not completed within its timeout.
    #[error("timed out waiting for completion")]
    Timeout,

    /// The registration vanished without being completed.
    ///
    /// This happens when the completing side drops its handle to the
    /// registry without ever resolving the key.
    #[error("wait abandoned before completion")]
    Abandoned,

    /// The completing side reported a failure.
    #[error("wait failed: {message}")]
    Failed {
        /// The failure description supplied to [`Waiter::fail`].
        message: String,
    },

    /// The registry's lock was poisoned.  This indicates a bug.
    #[error("waiter registry poisoned")]
    Poisoned,
}

impl HasKind for WaitError {
    fn kind(&self) -> ErrorKind {
        match self {
            WaitError::AlreadyPending => ErrorKind::Conflict,
            WaitError::Timeout => ErrorKind::Timeout,
            WaitError::Abandoned => ErrorKind::Cancelled,
            WaitError::Failed { .. } => ErrorKind::RemoteAgent,
            WaitError::Poisoned => ErrorKind::Internal,
        }
    }
}

/// The sender half stored for each registered key.
type Sending<T> = oneshot::Sender<Result<T, WaitError>>;

/// A registry mapping [`WaitKey`]s to pending one-shot futures.
///
/// Cloning a `Waiter` yields another handle onto the same registry.
pub struct Waiter<T> {
    /// The outstanding registrations.
    pending: Arc<Mutex<HashMap<WaitKey, Sending<T>>>>,
}

impl<T> Clone for Waiter<T> {
    fn clone(&self) -> Self {
        Waiter {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T: Send + 'static> Default for Waiter<T> {
    fn default() -> Self {
        Waiter::new()
    }
}

impl<T> std::fmt::Debug for Waiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Waiter<T> {
    /// Construct a new, empty registry.
    pub fn new() -> Self {
        Waiter {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Lock the registration table.
    fn table(&self) -> Result<MutexGuard<'_, HashMap<WaitKey, Sending<T>>>, WaitError> {
        self.pending.lock().map_err(|_| WaitError::Poisoned)
    }

    /// Register a wait for `key` and return a future that resolves when
    /// some other task completes or fails the key, or when `timeout`
    /// elapses.
    ///
    /// The registration is made *synchronously*, before this function
    /// returns: a completion that races with the caller's first poll of
    /// the returned future is delivered, not lost.
    ///
    /// Returns [`WaitError::AlreadyPending`] if the key already has an
    /// outstanding future.
    pub fn wait(
        &self,
        key: &WaitKey,
        timeout: Duration,
    ) -> Result<impl Future<Output = Result<T, WaitError>> + Send, WaitError> {
        let rx = self.register(key)?;
        let pending = Arc::clone(&self.pending);
        let key = key.clone();
        Ok(async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(oneshot::Canceled)) => Err(WaitError::Abandoned),
                Err(_elapsed) => {
                    // Deregister before reporting, so that a late
                    // completion cannot resurrect this key.
                    if let Ok(mut table) = pending.lock() {
                        table.remove(&key);
                    }
                    trace!(%key, "wait timed out");
                    Err(WaitError::Timeout)
                }
            }
        })
    }

    /// Register a wait for `key` with no timeout.
    ///
    /// The returned future resolves only when the key is completed or
    /// failed, or when every other handle onto the registry is dropped.
    pub fn wait_indefinitely(
        &self,
        key: &WaitKey,
    ) -> Result<impl Future<Output = Result<T, WaitError>> + Send, WaitError> {
        let rx = self.register(key)?;
        Ok(async move {
            match rx.await {
                Ok(outcome) => outcome,
                Err(oneshot::Canceled) => Err(WaitError::Abandoned),
            }
        })
    }

    /// Insert a fresh registration for `key`, returning the receiving half.
    fn register(&self, key: &WaitKey) -> Result<oneshot::Receiver<Result<T, WaitError>>, WaitError> {
        let mut table = self.table()?;
        if table.contains_key(key) {
            return Err(WaitError::AlreadyPending);
        }
        let (tx, rx) = oneshot::channel();
        table.insert(key.clone(), tx);
        trace!(%key, "wait registered");
        Ok(rx)
    }

    /// Complete the wait registered under `key` with `value`.
    ///
    /// The registration is removed before the waiter is resumed.  Returns
    /// true if a waiter was resumed, false if no wait was registered for
    /// the key (or the waiting future had already been dropped).
    pub fn complete(&self, key: &WaitKey, value: T) -> bool {
        self.resolve(key, Ok(value))
    }

    /// Fail the wait registered under `key`.
    ///
    /// The waiter resumes with [`WaitError::Failed`] carrying `message`.
    /// Returns true if a waiter was resumed.
    pub fn fail(&self, key: &WaitKey, message: impl Into<String>) -> bool {
        self.resolve(
            key,
            Err(WaitError::Failed {
                message: message.into(),
            }),
        )
    }

    /// Remove the registration for `key` and deliver `outcome` to it.
    fn resolve(&self, key: &WaitKey, outcome: Result<T, WaitError>) -> bool {
        let sender = match self.table() {
            Ok(mut table) => table.remove(key),
            Err(_) => None,
        };
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Return true if a wait is currently registered under `key`.
    pub fn is_waiting_for(&self, key: &WaitKey) -> bool {
        self.table().map(|t| t.contains_key(key)).unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn key(parts: &[&str]) -> WaitKey {
        WaitKey::new(parts.iter().copied())
    }

    #[test]
    fn key_display() {
        let k = key(&["file_stream", "agent-1", "123"]);
        assert_eq!(k.to_string(), "file_stream:agent-1:123");
    }

    #[tokio::test]
    async fn complete_resumes_waiter() {
        let w: Waiter<u32> = Waiter::new();
        let k = key(&["op", "a"]);
        let fut = w.wait(&k, Duration::from_secs(5)).unwrap();
        assert!(w.is_waiting_for(&k));
        assert!(w.complete(&k, 17));
        assert_eq!(fut.await.unwrap(), 17);
        assert!(!w.is_waiting_for(&k));
    }

    #[tokio::test]
    async fn second_wait_is_an_error() {
        let w: Waiter<()> = Waiter::new();
        let k = key(&["op"]);
        let _fut = w.wait(&k, Duration::from_secs(5)).unwrap();
        let err = w.wait(&k, Duration::from_secs(5)).map(|_| ()).unwrap_err();
        assert_eq!(err, WaitError::AlreadyPending);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_and_deregisters() {
        let w: Waiter<()> = Waiter::new();
        let k = key(&["op"]);
        let fut = w.wait(&k, Duration::from_millis(100)).unwrap();
        assert_eq!(fut.await.unwrap_err(), WaitError::Timeout);
        assert!(!w.is_waiting_for(&k));
        // The key is free again.
        let _fut2 = w.wait(&k, Duration::from_millis(100)).unwrap();
    }

    #[tokio::test]
    async fn fail_carries_message() {
        let w: Waiter<()> = Waiter::new();
        let k = key(&["op"]);
        let fut = w.wait(&k, Duration::from_secs(5)).unwrap();
        assert!(w.fail(&k, "file missing"));
        match fut.await.unwrap_err() {
            WaitError::Failed { message } => assert_eq!(message, "file missing"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_unknown_key_is_false() {
        let w: Waiter<()> = Waiter::new();
        assert!(!w.complete(&key(&["nope"]), ()));
        assert!(!w.fail(&key(&["nope"]), "x"));
    }

    #[tokio::test]
    async fn completion_races_with_first_poll() {
        // Registration is synchronous: completing before the future is
        // ever polled must still deliver the value.
        let w: Waiter<&'static str> = Waiter::new();
        let k = key(&["op"]);
        let fut = w.wait(&k, Duration::from_secs(5)).unwrap();
        assert!(w.complete(&k, "early"));
        assert_eq!(fut.await.unwrap(), "early");
    }

    #[tokio::test]
    async fn reentrant_wait_from_continuation() {
        let w: Waiter<u32> = Waiter::new();
        let k = key(&["op"]);
        let fut = w.wait(&k, Duration::from_secs(5)).unwrap();
        w.complete(&k, 1);
        let got = fut.await.unwrap();
        assert_eq!(got, 1);
        // The continuation can immediately wait on the same key.
        let fut2 = w.wait(&k, Duration::from_secs(5)).unwrap();
        w.complete(&k, 2);
        assert_eq!(fut2.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn indefinite_wait_sees_failure() {
        let w: Waiter<()> = Waiter::new();
        let k = key(&["op"]);
        let fut = w.wait_indefinitely(&k).unwrap();
        w.fail(&k, "torn down");
        assert!(matches!(fut.await, Err(WaitError::Failed { .. })));
    }
}
