//! First-release placement for periodic schedulables.
//!
//! With `elapsed = now - start` and `k = elapsed / period` (integer
//! division), a start in the past resolves as:
//!
//! | policy             | first release                | later releases       |
//! |--------------------|------------------------------|----------------------|
//! | `AdjustImmediate`  | now                          | now + n·period       |
//! | `AdjustForward`    | start + ⌈elapsed/period⌉·period | that instant + n·period |
//! | `AdjustBackward`   | now                          | start + (k+n)·period |
//! | `StrictPhasing`    | `LateStart`                  |                      |
//!
//! A start at or after `now` is always honored as given.

use std::time::Duration;

use super::policy::PhasingPolicy;
use crate::error::{raise, RtError, RtResult};
use crate::time::AbsoluteTime;

/// Placement of the first release and the phase later releases follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstRelease {
    /// When the first release happens.
    pub release_at: AbsoluteTime,
    /// Release `n` (1-based after the first) happens at `anchor + n·period`.
    pub anchor: AbsoluteTime,
}

impl FirstRelease {
    /// Nominal time of the `n`th release after the first.
    pub fn nth(&self, period: Duration, n: u64) -> AbsoluteTime {
        self.anchor + mul(period, n)
    }
}

/// Resolve the first release of a pattern starting at `start`.
pub fn first_release(
    start: AbsoluteTime,
    period: Duration,
    policy: PhasingPolicy,
    now: AbsoluteTime,
) -> RtResult<FirstRelease> {
    if period.is_zero() {
        return Err(raise(RtError::IllegalArgument("period must be positive")));
    }
    if start >= now {
        return Ok(FirstRelease {
            release_at: start,
            anchor: start,
        });
    }

    let elapsed = now.saturating_since(start);
    let whole = (elapsed.as_nanos() / period.as_nanos()) as u64;
    let aligned = start + mul(period, whole);

    Ok(match policy {
        PhasingPolicy::AdjustImmediate => FirstRelease {
            release_at: now,
            anchor: now,
        },
        PhasingPolicy::AdjustForward => {
            let next = if aligned == now { now } else { aligned + period };
            FirstRelease {
                release_at: next,
                anchor: next,
            }
        }
        PhasingPolicy::AdjustBackward => FirstRelease {
            release_at: now,
            anchor: aligned,
        },
        PhasingPolicy::StrictPhasing => return Err(RtError::LateStart { start, now }),
    })
}

fn mul(period: Duration, n: u64) -> Duration {
    let nanos = period.as_nanos().saturating_mul(n as u128);
    let secs = (nanos / 1_000_000_000).min(u64::MAX as u128) as u64;
    Duration::new(secs, (nanos % 1_000_000_000) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(10);

    fn ms(v: u64) -> AbsoluteTime {
        AbsoluteTime::from_millis(v)
    }

    #[test]
    fn test_future_start_is_kept() {
        for policy in PhasingPolicy::ALL {
            let first = first_release(ms(50), PERIOD, *policy, ms(20)).unwrap();
            assert_eq!(first.release_at, ms(50));
            assert_eq!(first.nth(PERIOD, 2), ms(70));
        }
    }

    #[test]
    fn test_immediate() {
        let first = first_release(ms(0), PERIOD, PhasingPolicy::AdjustImmediate, ms(1234)).unwrap();
        assert_eq!(first.release_at, ms(1234));
        assert_eq!(first.nth(PERIOD, 1), ms(1244));
    }

    #[test]
    fn test_forward_many_periods_elapsed() {
        let first = first_release(ms(3), PERIOD, PhasingPolicy::AdjustForward, ms(1234)).unwrap();
        assert_eq!(first.release_at, ms(1243));
        assert_eq!(first.nth(PERIOD, 1), ms(1253));

        let exact = first_release(ms(3), PERIOD, PhasingPolicy::AdjustForward, ms(1233)).unwrap();
        assert_eq!(exact.release_at, ms(1233));
    }

    #[test]
    fn test_backward_keeps_phase() {
        let first = first_release(ms(3), PERIOD, PhasingPolicy::AdjustBackward, ms(1234)).unwrap();
        assert_eq!(first.release_at, ms(1234));
        assert_eq!(first.anchor, ms(1233));
        assert_eq!(first.nth(PERIOD, 1), ms(1243));
    }

    #[test]
    fn test_strict_rejects_past_start() {
        let err = first_release(ms(0), PERIOD, PhasingPolicy::StrictPhasing, ms(1000)).unwrap_err();
        assert_eq!(err, RtError::LateStart { start: ms(0), now: ms(1000) });
    }

    #[test]
    fn test_zero_period() {
        assert!(first_release(ms(0), Duration::ZERO, PhasingPolicy::AdjustImmediate, ms(1)).is_err());
    }
}
