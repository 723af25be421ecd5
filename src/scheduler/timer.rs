//! Deadline tracking for the scheduler's timer wheel (§4.1 "Timers").
//!
//! Grounded on the monotonic clock accessors in `clock.rs`, generalized
//! from a single global clock reading into a min-heap of pending
//! deadlines so the executor can sleep until the next one rather than
//! busy-polling.
use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use super::FiberId;

#[derive(Debug, Eq, PartialEq)]
pub(super) struct TimerEntry {
    pub deadline: Instant,
    pub fiber: FiberId,
    pub seq: u64,
}

/// Ordered so that a `BinaryHeap` of `Reverse<TimerEntry>` pops the
/// earliest deadline first; `seq` breaks ties deterministically (FIFO
/// among equal deadlines).
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A future that resolves once `Instant::now()` passes a deadline.
/// Constructed by [`super::sleep`]; registers itself with the scheduler's
/// timer wheel on first poll.
pub struct Delay {
    deadline: Instant,
    armed: bool,
}

impl Delay {
    pub fn new(duration: Duration) -> Self {
        Delay {
            deadline: Instant::now() + duration,
            armed: false,
        }
    }

    pub fn until(deadline: Instant) -> Self {
        Delay {
            deadline,
            armed: false,
        }
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if Instant::now() >= this.deadline {
            return Poll::Ready(());
        }
        if !this.armed {
            super::arm_timer(this.deadline);
            this.armed = true;
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_entries_order_by_deadline_then_seq() {
        let now = Instant::now();
        let a = TimerEntry {
            deadline: now,
            fiber: 0,
            seq: 1,
        };
        let b = TimerEntry {
            deadline: now + Duration::from_millis(1),
            fiber: 1,
            seq: 0,
        };
        assert!(a < b);
    }
}
