//! A time-bounded map for short-lived capability tokens.
//!
//! Authentication challenges and proof-of-holding tokens live for
//! seconds to minutes and must validate *at most once*.  The cache
//! provides `set`/`get`/`remove` plus [`take`](ExpiringTokenCache::take),
//! an atomic get-and-remove which is the one-shot validation primitive:
//! two concurrent validations of the same token cannot both succeed.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// One cached value with its deadline.
#[derive(Debug, Clone)]
struct Entry<V> {
    /// The cached value.
    value: V,
    /// The instant at which the value stops being visible.
    expires_at: Instant,
}

/// A map whose entries expire at or before their time-to-live.
///
/// Expiry is lazy: entries past their deadline are invisible to reads
/// and are physically dropped when an access touches them or when an
/// insert sweeps the table.
#[derive(Debug)]
pub struct ExpiringTokenCache<K, V> {
    /// The live (and possibly some expired-but-unswept) entries.
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> Default for ExpiringTokenCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        ExpiringTokenCache::new()
    }
}

impl<K, V> ExpiringTokenCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Construct an empty cache.
    pub fn new() -> Self {
        ExpiringTokenCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `value` under `key`, expiring after `ttl`.
    ///
    /// Any previous value under the key is replaced and its deadline
    /// discarded.  Inserting also sweeps entries that have already
    /// expired, so the table cannot grow without bound under a workload
    /// that only ever inserts.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    /// Return a clone of the live value under `key`, if any.
    ///
    /// Does not consume the entry; use this only for tokens that are
    /// explicitly idempotent within their lifetime.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(key) {
            Some(e) if e.expires_at > now => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Atomically remove and return the live value under `key`.
    ///
    /// This is the one-shot validation primitive: of any number of
    /// concurrent `take`s for the same key, at most one observes the
    /// value.  An expired entry is dropped and reported as absent.
    pub fn take(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.remove(key) {
            Some(e) if e.expires_at > now => Some(e.value),
            _ => None,
        }
    }

    /// Remove the entry under `key`, live or not.  Returns true if an
    /// entry was present.
    pub fn remove(&self, key: &K) -> bool {
        let mut entries = match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(key).is_some()
    }

    /// Count the live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.values().filter(|e| e.expires_at > now).count()
    }

    /// Return true if the cache holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
