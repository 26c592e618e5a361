//! Hot reconfiguration.
//!
//! The reload plane holds the running [`Options`] snapshot.  When a new
//! snapshot arrives (the file watcher and its debouncing live outside
//! this crate), the plane diffs it against the running one, logs every
//! change, fans the diff out to the registered modules, and publishes
//! the pending-restart / pending-reconnect flags.  Reconciliation is
//! serialised behind one writer lock, and the source watcher is allowed
//! to be noisy: a redelivered snapshot diffs to nothing and is a no-op.

use std::sync::{Arc, Mutex, Weak};

use postage::watch;
use tracing::{debug, info, warn};

use slsk_error::ErrorReport as _;

use crate::diff::{diff_options, OptionDiff};
use crate::err::ConfigError;
use crate::options::Options;

/// What a module reports after applying a change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct ReconfigureStatus {
    /// The module applied what it could, but the server connection must
    /// be re-established for the rest to take effect.
    pub pending_reconnect: bool,
}

/// An object that can be reconfigured when the configuration changes.
///
/// Modules receive the whole new snapshot plus the diff that produced
/// it; most look only at their own section.  By convention a returned
/// error means the module could not apply a change it should have been
/// able to; the plane logs it and carries on.
pub trait ReconfigurableModule: Send + Sync {
    /// A short name for logs.
    fn name(&self) -> &'static str;

    /// Apply a new configuration.
    fn reconfigure(
        &self,
        new: &Arc<Options>,
        diff: &[OptionDiff],
    ) -> Result<ReconfigureStatus, ConfigError>;
}

/// The observable outcome of reconfiguration so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct ReloadState {
    /// Bumped on every applied (non-empty) reload.
    pub generation: u64,
    /// A change was applied that only takes effect after a restart.
    pub pending_restart: bool,
    /// A change was applied that only takes effect after the server
    /// connection is re-established.
    pub pending_reconnect: bool,
}

/// Everything the reload plane's writer lock protects.
struct ReloadInner {
    /// The running snapshot.
    current: Arc<Options>,
    /// The registered modules.
    modules: Vec<Weak<dyn ReconfigurableModule>>,
}

/// Owns the running configuration and pushes changes to the modules.
pub struct ReloadPlane {
    /// Snapshot and modules, behind the single writer lock.
    inner: Mutex<ReloadInner>,
    /// Publisher for [`ReloadState`].
    state_tx: Mutex<watch::Sender<ReloadState>>,
    /// Kept so subscribers can be minted at any time.
    state_rx: watch::Receiver<ReloadState>,
}

impl ReloadPlane {
    /// Construct a plane holding `initial` as the running snapshot.
    pub fn new(initial: Arc<Options>) -> Self {
        let (state_tx, state_rx) = watch::channel();
        ReloadPlane {
            inner: Mutex::new(ReloadInner {
                current: initial,
                modules: Vec::new(),
            }),
            state_tx: Mutex::new(state_tx),
            state_rx,
        }
    }

    /// Register a module to receive future changes.
    ///
    /// Modules are held weakly so the plane cannot keep them alive.
    pub fn register(&self, module: Weak<dyn ReconfigurableModule>) -> Result<(), ConfigError> {
        let mut inner = self.inner.lock().map_err(|_| ConfigError::Poisoned)?;
        inner.modules.push(module);
        Ok(())
    }

    /// The running snapshot.
    pub fn current(&self) -> Result<Arc<Options>, ConfigError> {
        let inner = self.inner.lock().map_err(|_| ConfigError::Poisoned)?;
        Ok(Arc::clone(&inner.current))
    }

    /// The current reload state.
    pub fn state(&self) -> ReloadState {
        *self.state_rx.borrow()
    }

    /// Subscribe to reload state changes.
    pub fn subscribe(&self) -> watch::Receiver<ReloadState> {
        self.state_rx.clone()
    }

    /// Reconcile a new snapshot against the running one.
    ///
    /// Returns the applied diff (empty for a redelivered or unchanged
    /// snapshot, in which case nothing was published).
    pub fn reconfigure(&self, new: Arc<Options>) -> Result<Vec<OptionDiff>, ConfigError> {
        new.validate()?;
        let mut inner = self.inner.lock().map_err(|_| ConfigError::Poisoned)?;

        let diffs = diff_options(&inner.current, &new)?;
        if diffs.is_empty() {
            debug!("configuration unchanged; nothing to apply");
            return Ok(diffs);
        }

        for d in &diffs {
            info!(
                path = %d.path,
                old = %d.display_value(&d.old),
                new = %d.display_value(&d.new),
                requires_restart = d.requires_restart,
                "configuration changed"
            );
        }

        let mut pending_reconnect = false;
        inner.modules.retain(|m| m.upgrade().is_some());
        for module in inner.modules.iter().filter_map(Weak::upgrade) {
            match module.reconfigure(&new, &diffs) {
                Ok(status) => pending_reconnect |= status.pending_reconnect,
                Err(e) => {
                    warn!(module = module.name(), "reconfiguration failed: {}", e.report());
                }
            }
        }

        inner.current = Arc::clone(&new);
        let pending_restart = diffs.iter().any(|d| d.requires_restart);
        {
            let mut tx = self.state_tx.lock().map_err(|_| ConfigError::Poisoned)?;
            let prior = *tx.borrow();
            *tx.borrow_mut() = ReloadState {
                generation: prior.generation + 1,
                pending_restart: prior.pending_restart || pending_restart,
                pending_reconnect: prior.pending_reconnect || pending_reconnect,
            };
        }
        info!(changes = diffs.len(), "configuration reloaded");
        Ok(diffs)
    }

    /// Clear the pending-reconnect flag, after the server connection has
    /// been re-established.
    pub fn reconnect_done(&self) -> Result<(), ConfigError> {
        let mut tx = self.state_tx.lock().map_err(|_| ConfigError::Poisoned)?;
        let prior = *tx.borrow();
        if prior.pending_reconnect {
            *tx.borrow_mut() = ReloadState {
                pending_reconnect: false,
                ..prior
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::diff::SoulseekPatch;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A module that records the patches it received.
    struct PatchRecorder {
        /// How many times reconfigure ran.
        calls: AtomicUsize,
        /// The last soulseek patch seen.
        last_patch: Mutex<Option<SoulseekPatch>>,
        /// Whether to report pending-reconnect.
        wants_reconnect: bool,
    }

    impl PatchRecorder {
        fn new(wants_reconnect: bool) -> Arc<Self> {
            Arc::new(PatchRecorder {
                calls: AtomicUsize::new(0),
                last_patch: Mutex::new(None),
                wants_reconnect,
            })
        }
    }

    impl ReconfigurableModule for PatchRecorder {
        fn name(&self) -> &'static str {
            "patch-recorder"
        }

        fn reconfigure(
            &self,
            new: &Arc<Options>,
            diff: &[OptionDiff],
        ) -> Result<ReconfigureStatus, ConfigError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let patch = SoulseekPatch::from_diffs(diff, new);
            let reconnect = self.wants_reconnect && !patch.is_empty();
            *self.last_patch.lock().unwrap() = Some(patch);
            Ok(ReconfigureStatus {
                pending_reconnect: reconnect,
            })
        }
    }

    #[test]
    fn applies_diffs_and_flags() {
        // The S6 shape: one soulseek-scoped change plus one
        // restart-required change.
        let plane = ReloadPlane::new(Arc::new(Options::default()));
        let module = PatchRecorder::new(true);
        plane
            .register(Arc::downgrade(&module) as Weak<dyn ReconfigurableModule>)
            .unwrap();

        let mut next = Options::default();
        next.soulseek.listen_port = Some(54321);
        next.instance_name = "attic".to_owned();
        let diffs = plane.reconfigure(Arc::new(next)).unwrap();
        assert_eq!(diffs.len(), 2);

        let patch = module.last_patch.lock().unwrap().clone().unwrap();
        assert_eq!(patch.changed, vec!["soulseek.listen_port".to_owned()]);

        let state = plane.state();
        assert!(state.pending_restart);
        assert!(state.pending_reconnect);
        assert_eq!(state.generation, 1);
    }

    #[test]
    fn redelivered_snapshot_is_a_no_op() {
        let plane = ReloadPlane::new(Arc::new(Options::default()));
        let module = PatchRecorder::new(false);
        plane
            .register(Arc::downgrade(&module) as Weak<dyn ReconfigurableModule>)
            .unwrap();

        let mut next = Options::default();
        next.soulseek.description = "new words".to_owned();
        let next = Arc::new(next);

        assert_eq!(plane.reconfigure(Arc::clone(&next)).unwrap().len(), 1);
        assert_eq!(module.calls.load(Ordering::SeqCst), 1);

        // The watcher fires again with the same content.
        assert!(plane.reconfigure(next).unwrap().is_empty());
        assert_eq!(module.calls.load(Ordering::SeqCst), 1, "modules not re-run");
        assert_eq!(plane.state().generation, 1);
    }

    #[test]
    fn dropped_modules_are_skipped() {
        let plane = ReloadPlane::new(Arc::new(Options::default()));
        let module = PatchRecorder::new(false);
        plane
            .register(Arc::downgrade(&module) as Weak<dyn ReconfigurableModule>)
            .unwrap();
        drop(module);

        let mut next = Options::default();
        next.soulseek.description = "whatever".to_owned();
        plane.reconfigure(Arc::new(next)).unwrap();
        assert_eq!(plane.state().generation, 1);
    }

    #[test]
    fn invalid_snapshot_is_rejected_before_diffing() {
        let plane = ReloadPlane::new(Arc::new(Options::default()));
        let mut next = Options::default();
        next.groups.global_slots = 0;
        assert!(matches!(
            plane.reconfigure(Arc::new(next)),
            Err(ConfigError::Invalid { .. })
        ));
        assert_eq!(plane.state().generation, 0);
    }

    #[test]
    fn reconnect_done_clears_the_flag() {
        let plane = ReloadPlane::new(Arc::new(Options::default()));
        let module = PatchRecorder::new(true);
        plane
            .register(Arc::downgrade(&module) as Weak<dyn ReconfigurableModule>)
            .unwrap();

        let mut next = Options::default();
        next.soulseek.listen_port = Some(1234);
        plane.reconfigure(Arc::new(next)).unwrap();
        assert!(plane.state().pending_reconnect);

        plane.reconnect_done().unwrap();
        assert!(!plane.state().pending_reconnect);
        // Restart-pending is sticky until an actual restart.
        assert_eq!(plane.state().generation, 1);
    }
}
