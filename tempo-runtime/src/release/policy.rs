//! # Release policies
//!
//! - [`QueueOverflowPolicy`]: what happens to an arrival when a handler's
//!   arrival queue is full.
//! - [`MinimumInterarrivalPolicy`]: what happens to a sporadic arrival that
//!   comes strictly closer than the minimum interarrival time.
//! - [`PhasingPolicy`]: where the first periodic release goes when the
//!   nominal start is already in the past.
//!
//! Every policy is addressable by its upper-case name for configuration
//! driven setup:
//!
//! ```text
//! QueueOverflowPolicy::value("SAVE")       → Ok(QueueOverflowPolicy::Save)
//! "ADJUST_FORWARD".parse::<PhasingPolicy>() → Ok(PhasingPolicy::AdjustForward)
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{raise, RtError, RtResult};

macro_rules! named_policy {
    ($ty:ident, $what:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            /// Look up a policy by its upper-case name.
            pub fn value(name: &str) -> RtResult<Self> {
                match name {
                    $($name => Ok($ty::$variant),)+
                    _ => Err(raise(RtError::IllegalArgument(concat!("unknown ", $what)))),
                }
            }

            /// Upper-case name of the policy.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = RtError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::value(s)
            }
        }
    };
}

/// Handling of an arrival that finds the arrival queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueOverflowPolicy {
    /// No queue: arrivals only bump the pending fire count.
    Disable,
    /// Fail with `ArrivalQueueOverflow`; ignored on the timer fire path.
    Except,
    /// Drop the new arrival.
    Ignore,
    /// Overwrite the newest queued arrival.
    Replace,
    /// Grow the queue (default).
    #[default]
    Save,
}

named_policy!(QueueOverflowPolicy, "queue overflow policy", {
    Disable => "DISABLE",
    Except => "EXCEPT",
    Ignore => "IGNORE",
    Replace => "REPLACE",
    Save => "SAVE",
});

/// Handling of a sporadic arrival closer than the minimum interarrival time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MinimumInterarrivalPolicy {
    /// Fail with `MitViolation`.
    Except,
    /// Drop the arrival.
    Ignore,
    /// Accept the arrival, stamped one interarrival after the previous one (default).
    #[default]
    Save,
    /// Replace the newest queued arrival with this one.
    Replace,
}

named_policy!(MinimumInterarrivalPolicy, "minimum interarrival policy", {
    Except => "EXCEPT",
    Ignore => "IGNORE",
    Save => "SAVE",
    Replace => "REPLACE",
});

/// Placement of the first periodic release when the start time has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PhasingPolicy {
    /// Release now; later releases are one period apart from now (default).
    #[default]
    AdjustImmediate,
    /// Release at the next phase-aligned instant.
    AdjustForward,
    /// Release now, keeping later releases aligned to the original phase.
    AdjustBackward,
    /// Fail with `LateStart`.
    StrictPhasing,
}

named_policy!(PhasingPolicy, "phasing policy", {
    AdjustImmediate => "ADJUST_IMMEDIATE",
    AdjustForward => "ADJUST_FORWARD",
    AdjustBackward => "ADJUST_BACKWARD",
    StrictPhasing => "STRICT_PHASING",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for policy in QueueOverflowPolicy::ALL {
            assert_eq!(QueueOverflowPolicy::value(policy.as_str()), Ok(*policy));
        }
        for policy in MinimumInterarrivalPolicy::ALL {
            assert_eq!(policy.to_string().parse::<MinimumInterarrivalPolicy>(), Ok(*policy));
        }
        for policy in PhasingPolicy::ALL {
            assert_eq!(PhasingPolicy::from_str(policy.as_str()), Ok(*policy));
        }
    }

    #[test]
    fn test_unknown_name() {
        assert!(matches!(QueueOverflowPolicy::value("save"), Err(RtError::IllegalArgument(_))));
        assert!("LATER".parse::<PhasingPolicy>().is_err());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(QueueOverflowPolicy::default(), QueueOverflowPolicy::Save);
        assert_eq!(MinimumInterarrivalPolicy::default(), MinimumInterarrivalPolicy::Save);
        assert_eq!(PhasingPolicy::default(), PhasingPolicy::AdjustImmediate);
    }
}
