//! Single-assignment future cell ([`LiftFuture`]/[`Resolver`]) and the
//! `wait`/`wait_all`/`wait_any` combinators (§4.1 "Futures").
//!
//! Grounded on the `Sender`/`Receiver` single-assignment cell in
//! `fiber/async/oneshot.rs`, generalized from a one-shot channel pair into
//! a cloneable, multi-waiter future whose result can be read any number of
//! times after it settles.
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::diagnostics::Diagnostic;
use super::timer::Delay;

enum FutureState<T> {
    Pending,
    Fulfilled(Rc<T>),
    Rejected(Diagnostic),
}

struct Shared<T> {
    state: FutureState<T>,
    wakers: Vec<Waker>,
}

/// A future value that is resolved at most once, by a matching
/// [`Resolver`], and can be awaited (or read via [`LiftFuture::peek`])
/// repeatedly afterwards. Cloning shares the same underlying cell.
pub struct LiftFuture<T> {
    shared: Rc<RefCell<Shared<T>>>,
}

impl<T> Clone for LiftFuture<T> {
    fn clone(&self) -> Self {
        LiftFuture {
            shared: self.shared.clone(),
        }
    }
}

/// The writer half paired with a [`LiftFuture`], obtained from
/// [`LiftFuture::pending`].
pub struct Resolver<T> {
    shared: Rc<RefCell<Shared<T>>>,
}

impl<T> LiftFuture<T> {
    /// Creates an unsettled future together with the resolver that will
    /// settle it.
    pub fn pending() -> (LiftFuture<T>, Resolver<T>) {
        let shared = Rc::new(RefCell::new(Shared {
            state: FutureState::Pending,
            wakers: Vec::new(),
        }));
        (
            LiftFuture {
                shared: shared.clone(),
            },
            Resolver { shared },
        )
    }

    /// An already-fulfilled future, for values computed synchronously.
    pub fn ready(value: T) -> Self {
        let shared = Rc::new(RefCell::new(Shared {
            state: FutureState::Fulfilled(Rc::new(value)),
            wakers: Vec::new(),
        }));
        LiftFuture { shared }
    }

    /// An already-rejected future.
    pub fn failed(diagnostic: Diagnostic) -> Self {
        let shared = Rc::new(RefCell::new(Shared {
            state: FutureState::Rejected(diagnostic),
            wakers: Vec::new(),
        }));
        LiftFuture { shared }
    }

    /// A stable identity for this cell, used by [`wait`] to detect a task
    /// waiting on a future it is itself responsible for settling.
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.shared) as usize
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.shared.borrow().state, FutureState::Pending)
    }

    /// Reads the current result without waiting; `None` while pending.
    pub fn peek(&self) -> Option<Result<Rc<T>, Diagnostic>> {
        match &self.shared.borrow().state {
            FutureState::Pending => None,
            FutureState::Fulfilled(v) => Some(Ok(v.clone())),
            FutureState::Rejected(d) => Some(Err(d.clone())),
        }
    }
}

impl<T> Resolver<T> {
    pub fn fulfill(self, value: T) {
        let mut shared = self.shared.borrow_mut();
        if matches!(shared.state, FutureState::Pending) {
            shared.state = FutureState::Fulfilled(Rc::new(value));
            for waker in shared.wakers.drain(..) {
                waker.wake();
            }
        }
    }

    pub fn reject(self, diagnostic: Diagnostic) {
        let mut shared = self.shared.borrow_mut();
        if matches!(shared.state, FutureState::Pending) {
            shared.state = FutureState::Rejected(diagnostic);
            for waker in shared.wakers.drain(..) {
                waker.wake();
            }
        }
    }
}

impl<T> Future for LiftFuture<T> {
    type Output = Result<Rc<T>, Diagnostic>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.borrow_mut();
        match &shared.state {
            FutureState::Pending => {
                shared.wakers.push(cx.waker().clone());
                Poll::Pending
            }
            FutureState::Fulfilled(v) => Poll::Ready(Ok(v.clone())),
            FutureState::Rejected(d) => Poll::Ready(Err(d.clone())),
        }
    }
}

impl<T> Unpin for LiftFuture<T> {}

thread_local! {
    static WAIT_STACK: RefCell<BTreeSet<usize>> = RefCell::new(BTreeSet::new());
}

fn self_wait_diagnostic() -> Diagnostic {
    Diagnostic::new(
        "runtime_error: deadlock: task is already waiting on this future",
        Vec::<crate::diagnostics::Value>::new(),
    )
}

/// Awaits `future`, raising a `runtime_error` diagnostic instead of
/// deadlocking if the current task is already waiting on this exact
/// future further up its own call stack (§4.1 "self-wait").
pub async fn wait<T>(future: LiftFuture<T>) -> Result<Rc<T>, Diagnostic> {
    let id = future.id();
    let inserted = WAIT_STACK.with(|s| s.borrow_mut().insert(id));
    if !inserted {
        return Err(self_wait_diagnostic());
    }
    let result = future.await;
    WAIT_STACK.with(|s| {
        s.borrow_mut().remove(&id);
    });
    result
}

/// The outcome of a timed [`wait_timeout`]/[`wait_all_timeout`] call
/// (§4.1 "`wait(future[, timeout_ms]) -> (ok, results | \"timed out\")`").
/// A rejection is *not* represented here: like plain [`wait`], a timed
/// wait still raises the future's diagnostic directly rather than
/// reporting it as an outcome variant.
#[derive(Debug)]
pub enum Timed<T> {
    /// The future settled before the deadline.
    Ready(T),
    /// The deadline elapsed first; the future (and its fiber) keeps
    /// running — there is no implicit cancellation (§5).
    TimedOut,
}

impl<T> Timed<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Timed::TimedOut)
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Timed::Ready(v) => Some(v),
            Timed::TimedOut => None,
        }
    }
}

struct Race<F> {
    inner: F,
    delay: Delay,
}

impl<F> Future for Race<F>
where
    F: Future + Unpin,
{
    type Output = Timed<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(v) = Pin::new(&mut this.inner).poll(cx) {
            return Poll::Ready(Timed::Ready(v));
        }
        if let Poll::Ready(()) = Pin::new(&mut this.delay).poll(cx) {
            return Poll::Ready(Timed::TimedOut);
        }
        Poll::Pending
    }
}

/// Like [`wait`], but returns [`Timed::TimedOut`] instead of suspending
/// forever if `timeout` elapses first; the future keeps running either
/// way (§4.1 "`wait(future[, timeout_ms])`", §8 "wait(a_future) returns
/// (true, results) iff the future fulfilled; (false, \"timed out\") iff
/// its timeout elapsed first").
pub async fn wait_timeout<T>(
    future: LiftFuture<T>,
    timeout: Duration,
) -> Result<Timed<Rc<T>>, Diagnostic> {
    let id = future.id();
    let inserted = WAIT_STACK.with(|s| s.borrow_mut().insert(id));
    if !inserted {
        return Err(self_wait_diagnostic());
    }
    let outcome = Race {
        inner: future,
        delay: Delay::new(timeout),
    }
    .await;
    WAIT_STACK.with(|s| {
        s.borrow_mut().remove(&id);
    });
    match outcome {
        Timed::Ready(Ok(v)) => Ok(Timed::Ready(v)),
        Timed::Ready(Err(d)) => Err(d),
        Timed::TimedOut => Ok(Timed::TimedOut),
    }
}

struct WaitAll<T> {
    futures: Vec<Option<LiftFuture<T>>>,
    results: Vec<Option<Result<Rc<T>, Diagnostic>>>,
}

impl<T> Future for WaitAll<T> {
    type Output = Result<Vec<Rc<T>>, Diagnostic>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut all_done = true;
        for i in 0..this.futures.len() {
            if this.results[i].is_none() {
                if let Some(fut) = this.futures[i].as_mut() {
                    match Pin::new(fut).poll(cx) {
                        Poll::Ready(r) => {
                            this.results[i] = Some(r);
                            this.futures[i] = None;
                        }
                        Poll::Pending => all_done = false,
                    }
                }
            }
        }
        if !all_done {
            return Poll::Pending;
        }
        let results = std::mem::take(&mut this.results);
        let mut oks = Vec::with_capacity(results.len());
        let mut errs = Vec::new();
        for r in results {
            match r.expect("all futures settled") {
                Ok(v) => oks.push(v),
                Err(d) => errs.push(d),
            }
        }
        if errs.is_empty() {
            Poll::Ready(Ok(oks))
        } else {
            Poll::Ready(Err(Diagnostic::aggregate("task_error", errs)))
        }
    }
}

/// Awaits every future in `futures`, returning their values in order if
/// all fulfill, or an aggregated diagnostic (§4.4 "aggregation") if one
/// or more reject.
pub async fn wait_all<T>(futures: Vec<LiftFuture<T>>) -> Result<Vec<Rc<T>>, Diagnostic> {
    WaitAll {
        results: futures.iter().map(|_| None).collect(),
        futures: futures.into_iter().map(Some).collect(),
    }
    .await
}

/// Like [`wait_all`], but returns [`Timed::TimedOut`] instead of waiting
/// forever if `timeout` elapses before every future has settled (§4.1
/// "`wait_all(futures[, timeout_ms])`"). Futures that hadn't yet settled
/// keep running.
pub async fn wait_all_timeout<T>(
    futures: Vec<LiftFuture<T>>,
    timeout: Duration,
) -> Result<Timed<Vec<Rc<T>>>, Diagnostic> {
    let outcome = Race {
        inner: WaitAll {
            results: futures.iter().map(|_| None).collect(),
            futures: futures.into_iter().map(Some).collect(),
        },
        delay: Delay::new(timeout),
    }
    .await;
    match outcome {
        Timed::Ready(Ok(v)) => Ok(Timed::Ready(v)),
        Timed::Ready(Err(d)) => Err(d),
        Timed::TimedOut => Ok(Timed::TimedOut),
    }
}

struct WaitAny<T> {
    futures: Vec<Option<LiftFuture<T>>>,
    errors: Vec<Diagnostic>,
}

impl<T> Future for WaitAny<T> {
    type Output = Result<Rc<T>, Diagnostic>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut pending = false;
        for slot in this.futures.iter_mut() {
            if let Some(fut) = slot.as_mut() {
                match Pin::new(fut).poll(cx) {
                    Poll::Ready(Ok(v)) => return Poll::Ready(Ok(v)),
                    Poll::Ready(Err(d)) => {
                        this.errors.push(d);
                        *slot = None;
                    }
                    Poll::Pending => pending = true,
                }
            }
        }
        if pending {
            Poll::Pending
        } else {
            Poll::Ready(Err(Diagnostic::aggregate(
                "task_error",
                std::mem::take(&mut this.errors),
            )))
        }
    }
}

/// Awaits the first future in `futures` to fulfill; if all reject,
/// returns an aggregated diagnostic.
pub async fn wait_any<T>(futures: Vec<LiftFuture<T>>) -> Result<Rc<T>, Diagnostic> {
    WaitAny {
        futures: futures.into_iter().map(Some).collect(),
        errors: Vec::new(),
    }
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Value;

    #[test]
    fn ready_future_peeks_immediately() {
        let f = LiftFuture::ready(42);
        assert_eq!(*f.peek().unwrap().unwrap(), 42);
    }

    #[test]
    fn resolver_fulfills_pending_future() {
        let (future, resolver) = LiftFuture::pending();
        assert!(future.is_pending());
        resolver.fulfill("done".to_owned());
        assert_eq!(*future.peek().unwrap().unwrap(), "done");
    }

    #[test]
    fn resolver_rejects_pending_future() {
        let (future, resolver): (LiftFuture<i32>, _) = LiftFuture::pending();
        resolver.reject(Diagnostic::new("error: boom", Vec::<Value>::new()));
        assert!(future.peek().unwrap().is_err());
    }

    #[test]
    fn clone_shares_the_same_cell() {
        let (future, resolver) = LiftFuture::pending();
        let clone = future.clone();
        resolver.fulfill(1);
        assert_eq!(*clone.peek().unwrap().unwrap(), 1);
    }
}
