//! # Time Source
//!
//! The runtime treats its clock as an opaque tick source. Absolute instants
//! are [`AbsoluteTime`] values (offsets from the clock's epoch); relative
//! intervals are plain [`Duration`]s.
//!
//! - [`MonotonicClock`]: backed by `std::time::Instant`
//! - [`ManualClock`]: advanced explicitly, for deterministic tests

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::RtResult;
use crate::interrupt::InterruptToken;

/// An instant expressed as an offset from a clock's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AbsoluteTime(Duration);

impl AbsoluteTime {
    /// The clock epoch.
    pub const ZERO: AbsoluteTime = AbsoluteTime(Duration::ZERO);

    /// Instant `offset` after the epoch.
    pub const fn from_epoch(offset: Duration) -> Self {
        Self(offset)
    }

    /// Instant `ms` milliseconds after the epoch.
    pub const fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    /// Offset from the epoch.
    pub const fn since_epoch(&self) -> Duration {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_since(&self, earlier: AbsoluteTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    /// `self + d`, or `None` on overflow.
    pub fn checked_add(&self, d: Duration) -> Option<AbsoluteTime> {
        self.0.checked_add(d).map(AbsoluteTime)
    }
}

impl Add<Duration> for AbsoluteTime {
    type Output = AbsoluteTime;

    fn add(self, rhs: Duration) -> AbsoluteTime {
        AbsoluteTime(self.0.saturating_add(rhs))
    }
}

impl Sub<Duration> for AbsoluteTime {
    type Output = AbsoluteTime;

    fn sub(self, rhs: Duration) -> AbsoluteTime {
        AbsoluteTime(self.0.saturating_sub(rhs))
    }
}

impl fmt::Display for AbsoluteTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T+{:?}", self.0)
    }
}

/// Opaque time source consumed by the runtime.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> AbsoluteTime;

    /// Granularity of [`Clock::now`].
    fn resolution(&self) -> Duration;

    /// Longest real-time sleep taken before re-reading the clock.
    fn max_sleep_slice(&self) -> Duration {
        Duration::MAX
    }

    /// Block until `deadline`, failing with `Interrupted` if `token` fires.
    fn wait_until(&self, deadline: AbsoluteTime, token: &InterruptToken) -> RtResult<()> {
        loop {
            let now = self.now();
            if now >= deadline {
                return Ok(());
            }
            let remaining = deadline.saturating_since(now);
            token.sleep(remaining.min(self.max_sleep_slice()))?;
        }
    }
}

/// Wall-independent monotonic clock; its epoch is the moment it was created.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Create a clock whose epoch is now.
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> AbsoluteTime {
        AbsoluteTime(self.epoch.elapsed())
    }

    fn resolution(&self) -> Duration {
        Duration::from_nanos(1)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<AbsoluteTime>>,
}

impl ManualClock {
    /// Clock stopped at the epoch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock stopped at `start`.
    pub fn starting_at(start: AbsoluteTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        let mut now = self.now.lock();
        *now = *now + d;
    }

    /// Set the clock; it never moves backwards.
    pub fn set(&self, t: AbsoluteTime) {
        let mut now = self.now.lock();
        if t > *now {
            *now = t;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> AbsoluteTime {
        *self.now.lock()
    }

    fn resolution(&self) -> Duration {
        Duration::from_nanos(1)
    }

    fn max_sleep_slice(&self) -> Duration {
        Duration::from_millis(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_time_arithmetic_saturates() {
        let t = AbsoluteTime::from_millis(10);
        assert_eq!(t - Duration::from_millis(20), AbsoluteTime::ZERO);
        assert_eq!(t.saturating_since(AbsoluteTime::from_millis(30)), Duration::ZERO);
        assert_eq!((t + Duration::from_millis(5)).since_epoch(), Duration::from_millis(15));
    }

    #[test]
    fn test_manual_clock_never_goes_back() {
        let clock = ManualClock::starting_at(AbsoluteTime::from_millis(100));
        clock.set(AbsoluteTime::from_millis(50));
        assert_eq!(clock.now(), AbsoluteTime::from_millis(100));
        clock.advance(Duration::from_millis(1));
        assert_eq!(clock.now(), AbsoluteTime::from_millis(101));
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now() > a);
    }

    #[test]
    fn test_wait_until_on_manual_clock() {
        let clock = ManualClock::new();
        let token = InterruptToken::new();
        let waiter = {
            let clock = clock.clone();
            std::thread::spawn(move || clock.wait_until(AbsoluteTime::from_millis(5), &token))
        };
        std::thread::sleep(Duration::from_millis(5));
        clock.advance(Duration::from_millis(5));
        assert!(waiter.join().unwrap().is_ok());
    }
}
