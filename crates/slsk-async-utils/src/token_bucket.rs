//! An interval-refilled token bucket.
//!
//! Used to meter work that must not exceed a configured rate, such as
//! upload bandwidth slices.  The bucket holds at most `capacity` tokens;
//! once per `interval` it refills to capacity.  A caller that finds the
//! bucket empty suspends until the next tick boundary rather than
//! failing.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use slsk_error::{ErrorKind, HasKind};

/// An error from configuring a [`TokenBucket`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenBucketError {
    /// The capacity must be at least one token.
    #[error("token bucket capacity must be nonzero")]
    ZeroCapacity,

    /// The refill interval must be nonzero.
    #[error("token bucket interval must be nonzero")]
    ZeroInterval,

    /// The bucket's lock was poisoned.  This indicates a bug.
    #[error("token bucket poisoned")]
    Poisoned,
}

impl HasKind for TokenBucketError {
    fn kind(&self) -> ErrorKind {
        match self {
            TokenBucketError::ZeroCapacity | TokenBucketError::ZeroInterval => {
                ErrorKind::ValidationFailed
            }
            TokenBucketError::Poisoned => ErrorKind::Internal,
        }
    }
}

/// The mutable portion of a bucket.
#[derive(Debug)]
struct BucketState {
    /// Maximum number of tokens the bucket can hold.
    capacity: u64,
    /// Tokens currently available.
    available: u64,
    /// When the bucket last refilled (or was created).
    last_refill: Instant,
}

/// An interval-refilled token bucket.
///
/// The clock is derived rather than driven: instead of a background task
/// resetting the bucket, each operation tops the bucket up to capacity if
/// at least one whole interval has elapsed since the last refill.  An
/// empty bucket suspends [`get`](Self::get) callers until the next tick
/// boundary.
#[derive(Debug)]
pub struct TokenBucket {
    /// Refill period.
    interval: Duration,
    /// Mutable state.  Never held across an await point.
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Construct a bucket holding `capacity` tokens, refilled every
    /// `interval`.
    pub fn new(capacity: u64, interval: Duration) -> Result<Self, TokenBucketError> {
        if capacity == 0 {
            return Err(TokenBucketError::ZeroCapacity);
        }
        if interval.is_zero() {
            return Err(TokenBucketError::ZeroInterval);
        }
        Ok(TokenBucket {
            interval,
            state: Mutex::new(BucketState {
                capacity,
                available: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Take up to `count` tokens from the bucket, suspending while the
    /// bucket is empty.
    ///
    /// Returns the number of tokens actually granted:
    /// `min(count, available, capacity)`.  A request for zero tokens
    /// returns zero immediately.
    pub async fn get(&self, count: u64) -> Result<u64, TokenBucketError> {
        if count == 0 {
            return Ok(0);
        }
        loop {
            let wait_until = {
                let mut state = self.lock()?;
                self.refill(&mut state);
                if state.available > 0 {
                    let granted = count.min(state.available).min(state.capacity);
                    state.available -= granted;
                    return Ok(granted);
                }
                state.last_refill + self.interval
            };
            tokio::time::sleep_until(wait_until).await;
        }
    }

    /// Return `count` tokens to the bucket, clamped to capacity.
    ///
    /// Callers that took more tokens than they ultimately used hand the
    /// remainder back this way.  Non-positive counts are a no-op.
    pub fn refund(&self, count: i64) -> Result<(), TokenBucketError> {
        if count <= 0 {
            return Ok(());
        }
        let mut state = self.lock()?;
        state.available = state.available.saturating_add(count as u64).min(state.capacity);
        Ok(())
    }

    /// Change the bucket's capacity, retaining `min(available, capacity)`
    /// of the currently available tokens.
    pub fn set_capacity(&self, capacity: u64) -> Result<(), TokenBucketError> {
        if capacity == 0 {
            return Err(TokenBucketError::ZeroCapacity);
        }
        let mut state = self.lock()?;
        state.capacity = capacity;
        state.available = state.available.min(capacity);
        Ok(())
    }

    /// Return the number of currently available tokens, after any due
    /// refill.
    pub fn available(&self) -> Result<u64, TokenBucketError> {
        let mut state = self.lock()?;
        self.refill(&mut state);
        Ok(state.available)
    }

    /// Lock the bucket state.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BucketState>, TokenBucketError> {
        self.state.lock().map_err(|_| TokenBucketError::Poisoned)
    }

    /// Top the bucket up to capacity if at least one whole interval has
    /// elapsed since the last refill.
    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed >= self.interval {
            state.available = state.capacity;
            // Advance by whole intervals so tick boundaries stay regular.
            let ticks = elapsed.as_nanos() / self.interval.as_nanos().max(1);
            state.last_refill += self.interval.saturating_mul(ticks.min(u128::from(u32::MAX)) as u32);
        }
    }
}
