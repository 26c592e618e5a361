//! Delay schedules for reconnect loops.
//!
//! See [`ExponentialBackoff`] and [`StepSchedule`] for more information.

use std::time::Duration;

use rand::Rng;

/// An exponential backoff schedule for retrying a failed connection.
///
/// Successive delays follow the tabulated series `0, 1s, 3s, 7s, 15s,
/// 31s, …` (each step roughly doubling the total time waited so far),
/// capped at a configurable maximum.  A uniformly random jitter of up to
/// a quarter of the base delay is added on top, so that a fleet of
/// clients disconnected by the same outage does not reconnect in
/// lockstep and hammer the server the moment it comes back.
///
/// The schedule is stateful: each call to [`next_delay`](Self::next_delay)
/// advances the iteration counter, and [`reset`](Self::reset) rewinds it
/// after a successful connection.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// How many delays this schedule has produced since the last reset.
    iteration: u32,
    /// The largest base delay this schedule will produce.
    cap: Duration,
}

/// Default cap on the base delay: five minutes.
pub const DEFAULT_DELAY_CAP: Duration = Duration::from_millis(300_000);

/// Largest exponent we will compute before the cap necessarily applies.
///
/// `2^30` seconds is far beyond any sane cap; bounding the exponent keeps
/// the arithmetic comfortably inside `u64`.
const MAX_EXPONENT: u32 = 30;

impl ExponentialBackoff {
    /// Construct a new schedule with the given cap on the base delay.
    pub fn new(cap: Duration) -> Self {
        ExponentialBackoff { iteration: 0, cap }
    }

    /// Return the base (un-jittered) delay for a given iteration of the
    /// schedule, where iteration 0 is the delay before the first retry.
    ///
    /// The series is `(2^n - 1)` seconds, capped.
    pub fn base_delay(&self, iteration: u32) -> Duration {
        let n = iteration.min(MAX_EXPONENT);
        let secs = (1_u64 << n) - 1;
        Duration::from_secs(secs).min(self.cap)
    }

    /// Return the number of delays produced since the last reset.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Return the next delay to be used, jittered according to a given
    /// random number generator, and advance the schedule.
    ///
    /// The jitter is uniform in `[0, base/4]`.
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Duration {
        let base = self.base_delay(self.iteration);
        self.iteration = self.iteration.saturating_add(1);
        base + jitter(base, rng)
    }

    /// Return this schedule to its initial state.
    pub fn reset(&mut self) {
        self.iteration = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff::new(DEFAULT_DELAY_CAP)
    }
}

/// Compute a uniformly random jitter in `[0, base/4]`.
fn jitter<R: Rng>(base: Duration, rng: &mut R) -> Duration {
    let quarter_ms = (base.as_millis() / 4) as u64;
    if quarter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.random_range(0..=quarter_ms))
}

/// A fixed table of delays with a repeating tail.
///
/// Used where the sequence of waits is prescribed rather than computed,
/// such as the relay agent's hub reconnect schedule
/// `0, 1s, 3s, 10s, 30s, 30s, …`.  Once the table is exhausted the last
/// entry repeats forever.
#[derive(Clone, Debug)]
pub struct StepSchedule {
    /// The delay table.  Never empty.
    steps: Vec<Duration>,
    /// How many delays have been produced since the last reset.
    iteration: u32,
}

impl StepSchedule {
    /// Construct a schedule from a table of delays.
    ///
    /// An empty table is treated as a single zero delay.
    pub fn new(steps: Vec<Duration>) -> Self {
        let steps = if steps.is_empty() {
            vec![Duration::ZERO]
        } else {
            steps
        };
        StepSchedule {
            steps,
            iteration: 0,
        }
    }

    /// The relay agent's hub reconnect table.
    pub fn agent_reconnect() -> Self {
        StepSchedule::new(
            [0, 1, 3, 10, 30]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        )
    }

    /// Return the next delay and advance the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let idx = (self.iteration as usize).min(self.steps.len() - 1);
        self.iteration = self.iteration.saturating_add(1);
        self.steps[idx]
    }

    /// Return this schedule to its initial state.
    pub fn reset(&mut self) {
        self.iteration = 0;
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    /// A deterministic RNG for tests.
    fn testing_rng() -> ChaCha12Rng {
        ChaCha12Rng::seed_from_u64(0x5153_4b44)
    }

    #[test]
    fn tabulated_series() {
        let b = ExponentialBackoff::default();
        let secs: Vec<u64> = (0..11).map(|i| b.base_delay(i).as_secs()).collect();
        assert_eq!(secs, vec![0, 1, 3, 7, 15, 31, 63, 127, 255, 300, 300]);
    }

    #[test]
    fn cap_applies() {
        let b = ExponentialBackoff::new(Duration::from_secs(5));
        assert_eq!(b.base_delay(0), Duration::ZERO);
        assert_eq!(b.base_delay(3), Duration::from_secs(5));
        assert_eq!(b.base_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn jitter_bounds() {
        let mut b = ExponentialBackoff::default();
        let mut rng = testing_rng();
        for i in 0..20 {
            let base = b.base_delay(i);
            let d = b.next_delay(&mut rng);
            assert!(d >= base);
            assert!(d <= base + base / 4);
        }
        assert_eq!(b.iteration(), 20);
        b.reset();
        assert_eq!(b.iteration(), 0);
    }

    #[test]
    fn zero_base_has_no_jitter() {
        let mut b = ExponentialBackoff::default();
        let mut rng = testing_rng();
        assert_eq!(b.next_delay(&mut rng), Duration::ZERO);
    }

    #[test]
    fn step_schedule_tail_repeats() {
        let mut s = StepSchedule::agent_reconnect();
        let secs: Vec<u64> = (0..7).map(|_| s.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![0, 1, 3, 10, 30, 30, 30]);
        s.reset();
        assert_eq!(s.next_delay(), Duration::ZERO);
    }

    #[test]
    fn empty_step_table() {
        let mut s = StepSchedule::new(vec![]);
        assert_eq!(s.next_delay(), Duration::ZERO);
        assert_eq!(s.next_delay(), Duration::ZERO);
    }
}
