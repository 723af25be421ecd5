//! The cooperative, single-threaded fiber scheduler (§4.1 "Runtime").
//!
//! Fibers are modeled as native `async`/`await` futures driven by a
//! hand-rolled executor, rather than stackful coroutines: no crate in this
//! workspace's dependency corpus provides stackful coroutines, and native
//! futures let the rest of the crate (streams, tasks, timers) compose with
//! ordinary `.await` instead of callback plumbing. The executor loop and
//! its waker bridge are grounded on `fiber/async.rs`'s `block_on`, widened
//! from "run one future to completion" into "run a pool of fibers to
//! quiescence, parking idle ones on a timer wheel".
pub mod future;
pub mod timer;

pub use future::{wait, wait_all, wait_all_timeout, wait_any, wait_timeout, LiftFuture, Resolver, Timed};
pub use timer::Delay;

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use timer::TimerEntry;

use crate::diagnostics::Diagnostic;

pub type FiberId = usize;

/// Ticks the external I/O loop the scheduler waits on between drain
/// cycles (§4.1.1). Generalizes a libuv-style polling loop into a trait
/// without requiring a bundled event loop: the default [`TimerReactor`]
/// only understands the scheduler's own timer wheel, which is sufficient
/// whenever the only thing fibers wait on is a timer or another future.
/// An embedder bridging real OS I/O (see the file/process bridges in
/// `crate::io`) supplies its own `Reactor` that also polls file
/// descriptors or child processes during `turn`.
pub trait Reactor {
    /// Blocks for up to `timeout` waiting for external events, or
    /// returns early once one occurs. May return immediately.
    fn turn(&mut self, timeout: Duration);
}

/// The default [`Reactor`]: understands only the scheduler's own timer
/// wheel, so `turn` just sleeps until the next deadline (already computed
/// by the caller) or a short slice, whichever is asked for.
pub struct TimerReactor;

impl Reactor for TimerReactor {
    fn turn(&mut self, timeout: Duration) {
        if !timeout.is_zero() {
            std::thread::sleep(timeout);
        }
    }
}

struct Slot {
    future: Pin<Box<dyn Future<Output = ()>>>,
    waker: Waker,
}

struct Inner {
    fibers: Vec<Option<Slot>>,
    free: Vec<FiberId>,
    ready: VecDeque<FiberId>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    next_timer_seq: u64,
}

/// A handle to the process-wide (thread-local) fiber pool. Cheap to
/// clone; clones share the same pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<Inner>>,
}

/// Wakes a fiber by re-queuing its id. Holds only a `Weak` reference so a
/// waker outliving its scheduler (e.g. leaked into another thread by
/// mistake) is inert rather than dangling.
///
/// `Scheduler` is thread-confined by the single-threaded invariant this
/// crate documents throughout (`Rc`/`RefCell` everywhere); `std::task::
/// Wake` requires `Send + Sync` regardless, so it is asserted by
/// construction rather than being structurally true.
struct SchedWaker {
    id: FiberId,
    inner: Weak<RefCell<Inner>>,
}

unsafe impl Send for SchedWaker {}
unsafe impl Sync for SchedWaker {}

impl Wake for SchedWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.borrow_mut();
            if !inner.ready.contains(&self.id) {
                inner.ready.push_back(self.id);
            }
        }
    }
}

thread_local! {
    static SCHEDULER: Scheduler = Scheduler::new();
    static CURRENT_FIBER: RefCell<Option<FiberId>> = RefCell::new(None);
}

/// The process-wide (thread-local) scheduler instance.
pub fn scheduler() -> Scheduler {
    SCHEDULER.with(|s| s.clone())
}

/// The fiber currently being polled, if any. `None` when called from
/// outside a fiber's own poll (e.g. before the scheduler has started
/// running it). Lets other modules (e.g. `crate::task`'s per-fiber call
/// ancestry) key side tables on "whichever fiber is asking" without the
/// scheduler needing to know anything about them.
pub fn current_fiber() -> Option<FiberId> {
    CURRENT_FIBER.with(|c| *c.borrow())
}

fn arm_timer(deadline: Instant) {
    let fiber = CURRENT_FIBER.with(|c| *c.borrow());
    let fiber = match fiber {
        Some(f) => f,
        None => return,
    };
    SCHEDULER.with(|s| {
        let mut inner = s.inner.borrow_mut();
        let seq = inner.next_timer_seq;
        inner.next_timer_seq += 1;
        inner.timers.push(Reverse(TimerEntry {
            deadline,
            fiber,
            seq,
        }));
    });
}

impl Scheduler {
    fn new() -> Self {
        Scheduler {
            inner: Rc::new(RefCell::new(Inner {
                fibers: Vec::new(),
                free: Vec::new(),
                ready: VecDeque::new(),
                timers: BinaryHeap::new(),
                next_timer_seq: 0,
            })),
        }
    }

    /// Schedules `future` as a new fiber and returns its id. The fiber is
    /// polled for the first time on the next [`run`](Self::run) pass.
    pub fn spawn<Fut>(&self, future: Fut) -> FiberId
    where
        Fut: Future<Output = ()> + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let id = inner.free.pop().unwrap_or(inner.fibers.len());
        if id == inner.fibers.len() {
            inner.fibers.push(None);
            log::trace!("fiber pool grew to {} slots", inner.fibers.len());
        }
        let waker = Waker::from(Arc::new(SchedWaker {
            id,
            inner: Rc::downgrade(&self.inner),
        }));
        inner.fibers[id] = Some(Slot {
            future: Box::pin(future),
            waker,
        });
        inner.ready.push_back(id);
        id
    }

    /// Cancels fiber `id`: drops its future (and, per the fiber's own
    /// `Drop` impls, any resources it held) and removes any timer it was
    /// parked on so a stale wakeup can't resurrect it.
    pub fn abort(&self, id: FiberId) {
        log::debug!("aborting fiber {id}");
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.fibers.get_mut(id) {
            if slot.take().is_some() {
                inner.free.push(id);
            }
        }
        inner.ready.retain(|&r| r != id);
        let timers = std::mem::take(&mut inner.timers);
        inner.timers = timers.into_iter().filter(|Reverse(t)| t.fiber != id).collect();
    }

    /// Drives every scheduled fiber to completion using the default
    /// [`TimerReactor`]. See [`run_with`] for a custom [`Reactor`].
    ///
    /// A panic inside a fiber (e.g. a completion callback) is caught and
    /// converted into a `runtime_error` diagnostic, which is fatal to the
    /// whole run: per §4.1 "errors raised inside completion callbacks are
    /// fatal to the scheduler", it is propagated out of `run` itself
    /// rather than only failing the one fiber.
    pub fn run(&self) -> Result<(), Diagnostic> {
        self.run_with(&mut TimerReactor)
    }

    /// Drives every scheduled fiber to completion, calling
    /// `reactor.turn()` once per drain cycle when nothing is immediately
    /// ready, so an embedder can splice in real OS I/O waits alongside
    /// the timer wheel.
    pub fn run_with(&self, reactor: &mut dyn Reactor) -> Result<(), Diagnostic> {
        loop {
            self.drain_ready()?;
            let (any_fibers, next_deadline) = {
                let inner = self.inner.borrow();
                let any = inner.fibers.iter().any(Option::is_some);
                let deadline = inner.timers.peek().map(|Reverse(t)| t.deadline);
                (any, deadline)
            };
            if !any_fibers {
                break;
            }
            match next_deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    let remaining = deadline.saturating_duration_since(now);
                    reactor.turn(remaining);
                    self.fire_due_timers();
                }
                None => break,
            }
        }
        Ok(())
    }

    fn drain_ready(&self) -> Result<(), Diagnostic> {
        loop {
            let id = {
                let mut inner = self.inner.borrow_mut();
                match inner.ready.pop_front() {
                    Some(id) => id,
                    None => break,
                }
            };
            self.poll_fiber(id)?;
        }
        Ok(())
    }

    fn poll_fiber(&self, id: FiberId) -> Result<(), Diagnostic> {
        let mut slot = {
            let mut inner = self.inner.borrow_mut();
            match inner.fibers.get_mut(id).and_then(Option::take) {
                Some(slot) => slot,
                None => return Ok(()),
            }
        };
        CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(id));
        let waker = slot.waker.clone();
        let poll = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut cx = Context::from_waker(&waker);
            slot.future.as_mut().poll(&mut cx)
        }));
        CURRENT_FIBER.with(|c| *c.borrow_mut() = None);

        let poll = match poll {
            Ok(poll) => poll,
            Err(payload) => {
                self.inner.borrow_mut().free.push(id);
                return Err(Diagnostic::from_panic(payload));
            }
        };

        let mut inner = self.inner.borrow_mut();
        match poll {
            Poll::Pending => {
                if let Some(existing) = inner.fibers.get_mut(id) {
                    *existing = Some(slot);
                }
            }
            Poll::Ready(()) => {
                inner.free.push(id);
            }
        }
        Ok(())
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        let mut inner = self.inner.borrow_mut();
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = inner.timers.peek() {
            if entry.deadline <= now {
                let Reverse(entry) = inner.timers.pop().unwrap();
                due.push(entry.fiber);
            } else {
                break;
            }
        }
        for fiber in due {
            if !inner.ready.contains(&fiber) {
                inner.ready.push_back(fiber);
            }
        }
    }
}

/// Schedules `future` on the process-wide scheduler.
pub fn spawn<Fut>(future: Fut) -> FiberId
where
    Fut: Future<Output = ()> + 'static,
{
    scheduler().spawn(future)
}

/// Aborts fiber `id` on the process-wide scheduler.
pub fn abort(id: FiberId) {
    scheduler().abort(id)
}

/// Suspends the current fiber for `duration`, returning the actual
/// elapsed time (always `>= duration`, modulo scheduling slop) and the
/// `Instant` at which it woke (§4.1 "sleep(ms) -> (elapsed_ms, now_ms)").
pub async fn sleep(duration: Duration) -> (Duration, Instant) {
    let start = Instant::now();
    Delay::new(duration).await;
    (start.elapsed(), Instant::now())
}
