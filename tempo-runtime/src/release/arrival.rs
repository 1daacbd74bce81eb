//! Per-handler arrival queue.
//!
//! Every fire that reaches a handler is offered to its queue together with
//! the handler's current release snapshot. The minimum interarrival rule
//! runs first (sporadic patterns only), then the overflow policy.

use std::collections::VecDeque;

use super::params::ReleaseSnapshot;
use super::policy::{MinimumInterarrivalPolicy, QueueOverflowPolicy};
use crate::error::{RtError, RtResult};
use crate::event::Payload;
use crate::time::AbsoluteTime;

/// One fire as seen by a handler.
#[derive(Debug, Clone)]
pub struct Arrival {
    /// Arrival time, possibly restamped by the interarrival rule.
    pub time: AbsoluteTime,
    /// Data carried by the fire.
    pub payload: Payload,
}

impl Arrival {
    /// Arrival at `time` carrying `payload`.
    pub fn new(time: AbsoluteTime, payload: Payload) -> Self {
        Self { time, payload }
    }
}

/// What became of an offered arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Appended to the queue.
    Queued,
    /// Not queued, but counted as a pending release.
    Counted,
    /// Overwrote the newest queued arrival; no new release.
    Replaced,
    /// Discarded.
    Dropped,
}

impl Admission {
    /// Whether the arrival adds a pending release.
    pub fn adds_release(&self) -> bool {
        matches!(self, Admission::Queued | Admission::Counted)
    }
}

/// Bounded FIFO of arrivals for one handler.
#[derive(Debug)]
pub(crate) struct ArrivalQueue {
    entries: VecDeque<Arrival>,
    capacity: usize,
    last_accepted: Option<AbsoluteTime>,
}

impl ArrivalQueue {
    /// Queue with room for `initial_length` arrivals.
    pub(crate) fn new(initial_length: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(initial_length),
            capacity: initial_length,
            last_accepted: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn pop(&mut self) -> Option<Arrival> {
        self.entries.pop_front()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Offer `arrival` under the rules of `snapshot`.
    ///
    /// `from_timer` marks the timer fire path, where `Except` overflow is
    /// ignored instead of raised.
    pub(crate) fn admit(
        &mut self,
        mut arrival: Arrival,
        snapshot: &ReleaseSnapshot,
        from_timer: bool,
    ) -> RtResult<Admission> {
        if let (Some((minimum, policy)), Some(last)) = (snapshot.minimum_interarrival(), self.last_accepted) {
            let interval = arrival.time.saturating_since(last);
            if interval < minimum {
                match policy {
                    MinimumInterarrivalPolicy::Except => {
                        return Err(RtError::MitViolation { interval, minimum });
                    }
                    MinimumInterarrivalPolicy::Ignore => return Ok(Admission::Dropped),
                    MinimumInterarrivalPolicy::Replace => {
                        // The newest arrival keeps its slot in time.
                        return Ok(match self.entries.back_mut() {
                            Some(newest) => {
                                newest.payload = arrival.payload;
                                Admission::Replaced
                            }
                            None => Admission::Dropped,
                        });
                    }
                    MinimumInterarrivalPolicy::Save => arrival.time = last + minimum,
                }
            }
        }

        let policy = snapshot.overflow_policy;
        if policy == QueueOverflowPolicy::Disable {
            self.last_accepted = Some(arrival.time);
            return Ok(Admission::Counted);
        }

        let limit = match policy {
            QueueOverflowPolicy::Save => self.capacity,
            _ => self.capacity.max(1),
        };
        if self.entries.len() >= limit {
            match policy {
                QueueOverflowPolicy::Except if from_timer => return Ok(Admission::Dropped),
                QueueOverflowPolicy::Except => {
                    return Err(RtError::ArrivalQueueOverflow { capacity: limit });
                }
                QueueOverflowPolicy::Ignore => return Ok(Admission::Dropped),
                QueueOverflowPolicy::Replace => {
                    self.last_accepted = Some(arrival.time);
                    if let Some(newest) = self.entries.back_mut() {
                        *newest = arrival;
                    }
                    return Ok(Admission::Replaced);
                }
                QueueOverflowPolicy::Save | QueueOverflowPolicy::Disable => {
                    self.capacity = (self.capacity * 2).max(1);
                }
            }
        }

        self.last_accepted = Some(arrival.time);
        self.entries.push_back(arrival);
        Ok(Admission::Queued)
    }

    /// Time the interarrival rule measures the next arrival from.
    pub(crate) fn last_accepted(&self) -> Option<AbsoluteTime> {
        self.last_accepted
    }
}
