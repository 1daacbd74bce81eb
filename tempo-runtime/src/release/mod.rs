//! # Release Parameters
//!
//! How and when a schedulable is released:
//!
//! - [`ReleaseParameters`]: periodic, sporadic or aperiodic pattern plus
//!   cost, deadline, overflow policy, queue length and miss/overrun
//!   handlers. Shared between schedulables; read as a [`ReleaseSnapshot`]
//!   at each release.
//! - [`policy`]: string-addressable overflow, interarrival and phasing
//!   policies.
//! - [`first_release`]: where the first periodic release lands when the
//!   start has already passed.
//! - [`Arrival`] / [`Admission`]: a fire as queued by a handler.

mod arrival;
mod params;
mod phasing;
pub mod policy;

pub(crate) use arrival::ArrivalQueue;
pub use arrival::{Admission, Arrival};
pub use params::{ReleaseKind, ReleaseParameters, ReleaseSnapshot, StartTime};
pub use phasing::{first_release, FirstRelease};
pub use policy::{MinimumInterarrivalPolicy, PhasingPolicy, QueueOverflowPolicy};
