//! The upload queue and its release scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use futures::future::{FutureExt, Shared};
use tracing::{debug, info};

use slsk_async_utils::oneshot;

use crate::err::TransferError;
use crate::group::{QueueStrategy, UploadGroupsConfig, DEFAULT_GROUP};

/// Maps usernames to group names.
///
/// The peer network classifies users (privileged, leecher, …) through
/// channels this crate knows nothing about; the scheduler consults this
/// seam *at release time*, so a user reclassified while queued lands in
/// their current group, not the one they had when they enqueued.
pub trait UserService: Send + Sync {
    /// Return the name of the group the given user belongs to.
    ///
    /// Unknown group names fall back to `default` during selection.
    fn group_for(&self, username: &str) -> String;
}

/// Did an enqueue insert anything?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EnqueueResult {
    /// The upload was appended to the user's queue.
    Enqueued,
    /// The (user, filename) pair was already queued; nothing changed.
    AlreadyQueued,
}

/// An upload released by [`UploadQueue::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ReleasedUpload {
    /// The requesting user.
    pub username: String,
    /// The file being uploaded.
    pub filename: String,
    /// The group whose slot the upload now occupies.
    pub group: String,
}

/// The type of an upload's shared readiness future.
type ReadyFuture = Shared<oneshot::Receiver<()>>;

/// One queued or running upload.
struct Upload {
    /// The file being uploaded.
    filename: String,
    /// Global enqueue sequence number; the FIFO ordering key.
    sequence: u64,
    /// Round-robin ordering key.  Initialised to the enqueue sequence
    /// and bumped for all of a user's queued uploads whenever one of
    /// that user's uploads is released.
    round_robin_key: u64,
    /// When the upload was enqueued.
    enqueued_at: SystemTime,
    /// When the upload was released, if it has been.
    ready_at: Option<SystemTime>,
    /// When the transfer was started, if it has been.
    started_at: Option<SystemTime>,
    /// The group charged for the upload's slot, assigned at release.
    assigned_group: Option<String>,
    /// The sending half of the readiness signal.  Consumed at release;
    /// dropped (cancelling waiters) if the upload is removed first.
    ready_tx: Option<oneshot::Sender<()>>,
    /// The shareable receiving half handed out by `await_start`.
    ready_rx: ReadyFuture,
}

impl Upload {
    /// True if the upload has not yet been released.
    fn is_queued(&self) -> bool {
        self.ready_at.is_none()
    }
}

/// Live state for one group.
struct GroupState {
    /// The group's name.
    name: String,
    /// Release priority; lower first.
    priority: u32,
    /// Declaration index; breaks priority ties.
    insertion: usize,
    /// Slot budget, already clamped to the global cap.
    capacity: u32,
    /// Slots currently charged to this group.
    used_slots: u32,
    /// Release strategy.
    strategy: QueueStrategy,
}

/// A point-in-time copy of one group's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct GroupSnapshot {
    /// The group's name.
    pub name: String,
    /// Release priority.
    pub priority: u32,
    /// Slot budget.
    pub capacity: u32,
    /// Slots in use.
    pub used_slots: u32,
    /// Release strategy.
    pub strategy: QueueStrategy,
}

/// A point-in-time copy of the queue's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct QueueSnapshot {
    /// Per-group counters, in release order.
    pub groups: Vec<GroupSnapshot>,
    /// Uploads enqueued but not yet released.
    pub queued: usize,
    /// Uploads released and not yet completed.
    pub started: usize,
    /// Rolling average of reported transfer speeds, bytes/second.
    pub average_speed: u64,
}

impl QueueSnapshot {
    /// True if any group other than the named ones has a free slot.
    pub fn has_free_slot_excluding(&self, excluded: &[&str]) -> bool {
        self.groups
            .iter()
            .filter(|g| !excluded.contains(&g.name.as_str()))
            .any(|g| g.used_slots < g.capacity)
    }
}

/// Everything the queue's mutex protects.
struct QueueInner {
    /// Per-user upload lists, in enqueue order.
    uploads: HashMap<String, Vec<Upload>>,
    /// The group table, sorted by (priority, declaration order).
    groups: Vec<GroupState>,
    /// Source of enqueue sequence numbers and round-robin bumps.
    next_sequence: u64,
    /// Sum and count of reported transfer speeds.
    speed_sum: u64,
    /// Number of speed reports.
    speed_count: u64,
}

/// The upload queue: decides which enqueued upload is released next.
///
/// A single mutex guards the user map and the group table; `process`
/// runs entirely under it but performs no I/O, and readiness signals
/// are completed only after the lock is released.
pub struct UploadQueue {
    /// The guarded state.
    inner: Mutex<QueueInner>,
    /// The user→group mapping, consulted at release time.
    users: Arc<dyn UserService>,
}

impl UploadQueue {
    /// Construct a queue with the given group configuration.
    pub fn new(config: &UploadGroupsConfig, users: Arc<dyn UserService>) -> Self {
        UploadQueue {
            inner: Mutex::new(QueueInner {
                uploads: HashMap::new(),
                groups: build_groups(config),
                next_sequence: 0,
                speed_sum: 0,
                speed_count: 0,
            }),
            users,
        }
    }

    /// Lock the queue state.
    fn lock(&self) -> Result<MutexGuard<'_, QueueInner>, TransferError> {
        self.inner.lock().map_err(|_| TransferError::Poisoned)
    }

    /// Append an upload to the user's queue.
    ///
    /// Idempotent for a (user, filename) pair that is already present.
    pub fn enqueue(
        &self,
        username: impl Into<String>,
        filename: impl Into<String>,
    ) -> Result<EnqueueResult, TransferError> {
        let username = username.into();
        let filename = filename.into();
        let mut inner = self.lock()?;
        let sequence = inner.next_sequence;

        let list = inner.uploads.entry(username.clone()).or_default();
        if list.iter().any(|u| u.filename == filename) {
            return Ok(EnqueueResult::AlreadyQueued);
        }
        let (tx, rx) = oneshot::channel();
        list.push(Upload {
            filename: filename.clone(),
            sequence,
            round_robin_key: sequence,
            enqueued_at: SystemTime::now(),
            ready_at: None,
            started_at: None,
            assigned_group: None,
            ready_tx: Some(tx),
            ready_rx: rx.shared(),
        });
        inner.next_sequence += 1;
        debug!(username = %username, filename = %filename, "upload enqueued");
        Ok(EnqueueResult::Enqueued)
    }

    /// Return a future that resolves when the upload is released.
    ///
    /// The future may be awaited by any number of callers; it resolves
    /// immediately if the upload has already been released, and fails
    /// with [`TransferError::Cancelled`] if the upload is removed before
    /// release.
    pub fn await_start(
        &self,
        username: &str,
        filename: &str,
    ) -> Result<impl std::future::Future<Output = Result<(), TransferError>> + Send, TransferError>
    {
        let inner = self.lock()?;
        let upload = find_upload(&inner, username, filename)?;
        let ready = upload.ready_rx.clone();
        drop(inner);
        Ok(async move { ready.await.map_err(|_| TransferError::Cancelled) })
    }

    /// Remove an upload, releasing its group slot if it had one.
    ///
    /// Called when a transfer finishes, fails, or is cancelled while
    /// queued.  The slot is returned to the upload's *assigned* group:
    /// the group it was charged to at release, not the group its user
    /// maps to now.
    pub fn complete(&self, username: &str, filename: &str) -> Result<(), TransferError> {
        let mut inner = self.lock()?;
        let list = inner
            .uploads
            .get_mut(username)
            .ok_or_else(|| TransferError::UnknownUser {
                username: username.to_owned(),
            })?;
        let idx = list
            .iter()
            .position(|u| u.filename == filename)
            .ok_or_else(|| TransferError::UnknownUpload {
                username: username.to_owned(),
                filename: filename.to_owned(),
            })?;
        let upload = list.remove(idx);
        if list.is_empty() {
            inner.uploads.remove(username);
        }
        if let Some(group) = upload.assigned_group.as_deref() {
            if let Some(g) = inner.groups.iter_mut().find(|g| g.name == group) {
                g.used_slots = g.used_slots.saturating_sub(1);
            }
        }
        debug!(username = %username, filename = %filename, "upload completed");
        Ok(())
    }

    /// Release at most one upload, if any group has both a free slot and
    /// a candidate.
    ///
    /// Groups are visited in ascending priority (declaration order
    /// breaking ties); within the chosen group the strategy picks the
    /// winner.  The released upload's readiness signal is completed
    /// after the queue lock is dropped.
    pub fn process(&self) -> Result<Option<ReleasedUpload>, TransferError> {
        let (released, tx) = {
            let mut inner = self.lock()?;
            match self.select(&mut inner) {
                Some(selection) => selection,
                None => return Ok(None),
            }
        };
        // Signal outside the lock: the waiter may run arbitrary code.
        let _ = tx.send(());
        info!(
            username = %released.username,
            filename = %released.filename,
            group = %released.group,
            "upload released"
        );
        Ok(Some(released))
    }

    /// The selection algorithm.  Runs under the queue mutex.
    fn select(&self, inner: &mut QueueInner) -> Option<(ReleasedUpload, oneshot::Sender<()>)> {
        // Resolve each queued user's group once per pass.
        let user_groups: HashMap<String, String> = inner
            .uploads
            .keys()
            .map(|u| {
                let mut g = self.users.group_for(u);
                if !inner.groups.iter().any(|gs| gs.name == g) {
                    g = DEFAULT_GROUP.to_owned();
                }
                (u.clone(), g)
            })
            .collect();

        let group_order: Vec<usize> = (0..inner.groups.len()).collect();
        for gi in group_order {
            let (group_name, strategy, has_room) = {
                let g = &inner.groups[gi];
                (g.name.clone(), g.strategy, g.used_slots < g.capacity)
            };
            if !has_room {
                continue;
            }

            // Each user's head-of-list queued upload is that user's
            // candidate; only users mapped to this group compete.
            let winner = inner
                .uploads
                .iter()
                .filter(|(user, _)| user_groups.get(*user).map(String::as_str) == Some(group_name.as_str()))
                .filter_map(|(user, list)| {
                    list.iter()
                        .find(|u| u.is_queued())
                        .map(|u| (user.clone(), u.filename.clone(), u.sequence, u.round_robin_key))
                })
                .min_by(|a, b| {
                    let key = |c: &(String, String, u64, u64)| match strategy {
                        QueueStrategy::FirstInFirstOut => c.2,
                        QueueStrategy::RoundRobin => c.3,
                    };
                    key(a)
                        .cmp(&key(b))
                        .then_with(|| a.0.cmp(&b.0))
                        .then_with(|| a.2.cmp(&b.2))
                        .then_with(|| a.1.cmp(&b.1))
                });

            let Some((username, filename, _, _)) = winner else {
                continue;
            };

            let now = SystemTime::now();
            let bump = inner.next_sequence;
            inner.next_sequence += 1;

            let mut ready_tx = None;
            if let Some(list) = inner.uploads.get_mut(&username) {
                for u in list.iter_mut() {
                    if u.filename == filename {
                        u.ready_at = Some(now);
                        u.started_at = Some(now);
                        u.assigned_group = Some(group_name.clone());
                        ready_tx = u.ready_tx.take();
                    } else if u.is_queued() {
                        // The release sends this user to the back of the
                        // round-robin rotation.
                        u.round_robin_key = bump;
                    }
                }
            }
            inner.groups[gi].used_slots += 1;

            let released = ReleasedUpload {
                username,
                filename,
                group: group_name,
            };
            // The sender is present unless the upload was somehow
            // released twice, which `is_queued` rules out.
            return ready_tx.map(|tx| (released, tx));
        }
        None
    }

    /// Rebuild the group table from a new configuration.
    ///
    /// `used_slots` is carried over for every group whose name persists.
    /// Running uploads whose group disappeared are re-bucketed into
    /// `default` for accounting only; they run to completion and no
    /// upload is cancelled.
    pub fn reconfigure(&self, config: &UploadGroupsConfig) -> Result<(), TransferError> {
        let mut inner = self.lock()?;
        let mut groups = build_groups(config);

        // Carry used_slots across by name.
        for g in &mut groups {
            if let Some(prev) = inner.groups.iter().find(|p| p.name == g.name) {
                g.used_slots = prev.used_slots;
            }
        }

        // Re-bucket running uploads whose group vanished.
        let mut orphaned = 0_u32;
        for list in inner.uploads.values_mut() {
            for u in list.iter_mut() {
                if let Some(assigned) = u.assigned_group.as_deref() {
                    if !groups.iter().any(|g| g.name == assigned) {
                        u.assigned_group = Some(DEFAULT_GROUP.to_owned());
                        orphaned += 1;
                    }
                }
            }
        }
        if orphaned > 0 {
            if let Some(default) = groups.iter_mut().find(|g| g.name == DEFAULT_GROUP) {
                default.used_slots = default.used_slots.saturating_add(orphaned);
            }
            info!(count = orphaned, "re-bucketed running uploads into the default group");
        }

        inner.groups = groups;
        Ok(())
    }

    /// Record a transfer's reported speed, in bytes per second.
    pub fn record_transfer_speed(&self, bytes_per_second: u64) -> Result<(), TransferError> {
        let mut inner = self.lock()?;
        inner.speed_sum = inner.speed_sum.saturating_add(bytes_per_second);
        inner.speed_count += 1;
        Ok(())
    }

    /// Take a point-in-time copy of the queue's counters.
    pub fn snapshot(&self) -> Result<QueueSnapshot, TransferError> {
        let inner = self.lock()?;
        let queued = inner
            .uploads
            .values()
            .flat_map(|l| l.iter())
            .filter(|u| u.is_queued())
            .count();
        let started = inner
            .uploads
            .values()
            .flat_map(|l| l.iter())
            .filter(|u| !u.is_queued())
            .count();
        Ok(QueueSnapshot {
            groups: inner
                .groups
                .iter()
                .map(|g| GroupSnapshot {
                    name: g.name.clone(),
                    priority: g.priority,
                    capacity: g.capacity,
                    used_slots: g.used_slots,
                    strategy: g.strategy,
                })
                .collect(),
            queued,
            started,
            average_speed: if inner.speed_count == 0 {
                0
            } else {
                inner.speed_sum / inner.speed_count
            },
        })
    }

    /// When the named upload was enqueued, if it is present.
    pub fn enqueued_at(
        &self,
        username: &str,
        filename: &str,
    ) -> Result<SystemTime, TransferError> {
        let inner = self.lock()?;
        Ok(find_upload(&inner, username, filename)?.enqueued_at)
    }
}

/// Look up one upload or report which half of the key was missing.
fn find_upload<'a>(
    inner: &'a QueueInner,
    username: &str,
    filename: &str,
) -> Result<&'a Upload, TransferError> {
    let list = inner
        .uploads
        .get(username)
        .ok_or_else(|| TransferError::UnknownUser {
            username: username.to_owned(),
        })?;
    list.iter()
        .find(|u| u.filename == filename)
        .ok_or_else(|| TransferError::UnknownUpload {
            username: username.to_owned(),
            filename: filename.to_owned(),
        })
}

/// Build the live group table from configuration: built-ins first, then
/// user-defined groups in declaration order, sorted by priority with
/// declaration order breaking ties.  Capacities are clamped to the
/// global cap.
fn build_groups(config: &UploadGroupsConfig) -> Vec<GroupState> {
    let mut groups: Vec<GroupState> = config
        .declared()
        .enumerate()
        .map(|(insertion, (name, gc))| GroupState {
            name: name.to_owned(),
            priority: gc.priority,
            insertion,
            capacity: gc.slots.min(config.global_slots),
            used_slots: 0,
            strategy: gc.strategy,
        })
        .collect();
    groups.sort_by_key(|g| (g.priority, g.insertion));
    groups
}
