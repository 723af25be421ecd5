//! The streaming pipeline: backpressure-aware [`Readable`]/[`Writable`]
//! endpoints, [`Duplex`] (both directions, independent), and [`Transform`]
//! (both directions, one driven by the other) (§4.3 "Streams").
//!
//! Grounded on `fiber/channel.rs`'s bounded-channel-with-backpressure
//! shape, generalized from a blocking rendezvous channel into a
//! non-blocking, `SegQueue`-backed buffer whose backpressure signal
//! (`write` returning `false`) and drain notification are driven through
//! scheduler futures instead of fiber suspension.
pub mod array;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crossbeam_queue::SegQueue;

use crate::diagnostics::Diagnostic;

pub type Chunk = Vec<u8>;

/// The high-water mark a stream gets when nothing more specific is asked
/// for (§3 "Each stream has a high-water mark (default 8 chunks)").
pub const DEFAULT_HIGH_WATER_MARK: usize = 8;

/// Shared buffer state backing every stream endpoint. Not constructed
/// directly by users; obtained via [`Queue::new`] when building a
/// concrete stream.
pub struct Queue {
    buffer: SegQueue<Chunk>,
    len: Cell<usize>,
    high_water_mark: usize,
    ended: Cell<bool>,
    /// Set alongside `ended` when the stream closed because of a rejection
    /// rather than a clean end marker (§3 "terminal-error slot").
    terminal_error: RefCell<Option<Diagnostic>>,
    /// Nesting depth of outstanding [`Writable::cork`] calls (§4.3 "nested
    /// corks are a counter"); writes buffer locally while this is nonzero,
    /// and only the matching `uncork` that brings it back to zero flushes.
    corked: Cell<u32>,
    cork_buffer: RefCell<VecDeque<Chunk>>,
    data_wakers: RefCell<Vec<Waker>>,
    drain_wakers: RefCell<Vec<Waker>>,
    drain_callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
    finish_wakers: RefCell<Vec<Waker>>,
    finish_callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
    end_callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
    /// `flowing` (§4.3 "Readable contract": `start()`/`stop()` "switch
    /// between flowing and paused") delivers pushed chunks to every
    /// [`data_callbacks`](Self::data_callbacks) subscriber as soon as
    /// they arrive instead of leaving them buffered for [`Readable::read`].
    flowing: Cell<bool>,
    data_callbacks: RefCell<Vec<Box<dyn Fn(Chunk)>>>,
    readable_callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Queue {
    /// A queue at the default high-water mark (§3).
    pub fn new_default() -> Rc<Self> {
        Self::new(DEFAULT_HIGH_WATER_MARK)
    }

    pub fn new(high_water_mark: usize) -> Rc<Self> {
        Rc::new(Queue {
            buffer: SegQueue::new(),
            len: Cell::new(0),
            high_water_mark,
            ended: Cell::new(false),
            terminal_error: RefCell::new(None),
            corked: Cell::new(0),
            cork_buffer: RefCell::new(VecDeque::new()),
            data_wakers: RefCell::new(Vec::new()),
            drain_wakers: RefCell::new(Vec::new()),
            drain_callbacks: RefCell::new(Vec::new()),
            finish_wakers: RefCell::new(Vec::new()),
            finish_callbacks: RefCell::new(Vec::new()),
            end_callbacks: RefCell::new(Vec::new()),
            flowing: Cell::new(false),
            data_callbacks: RefCell::new(Vec::new()),
            readable_callbacks: RefCell::new(Vec::new()),
        })
    }

    fn wake_data(&self) {
        for waker in self.data_wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    /// Fires every one-shot `on_readable` subscriber once there's
    /// something to observe: buffered data, or a clean/errored end.
    fn fire_readable(&self) {
        if self.len.get() == 0 && !self.ended.get() {
            return;
        }
        for callback in self.readable_callbacks.borrow_mut().drain(..) {
            callback();
        }
    }

    /// In flowing mode, drains the buffer straight into every `on_data`
    /// subscriber instead of leaving chunks for `read`/`read_async`
    /// (§4.3 "In flowing mode, pushed chunks are delivered to all data
    /// consumers immediately").
    fn pump_flowing(&self) {
        if !self.flowing.get() {
            return;
        }
        loop {
            let chunk = match self.buffer.pop() {
                Some(chunk) => chunk,
                None => break,
            };
            self.len.set(self.len.get() - 1);
            let subscribers = self.data_callbacks.borrow();
            for callback in subscribers.iter() {
                callback(chunk.clone());
            }
        }
        if self.below_high_water_mark() {
            self.fire_drain();
        }
        self.fire_end_if_settled();
        self.fire_finish_if_settled();
    }

    fn fire_end_if_settled(&self) {
        if !(self.ended.get() && self.len.get() == 0) {
            return;
        }
        for callback in self.end_callbacks.borrow_mut().drain(..) {
            callback();
        }
    }

    fn fire_drain(&self) {
        for waker in self.drain_wakers.borrow_mut().drain(..) {
            waker.wake();
        }
        for callback in self.drain_callbacks.borrow_mut().drain(..) {
            callback();
        }
    }

    fn below_high_water_mark(&self) -> bool {
        self.len.get() < self.high_water_mark
    }

    fn finished(&self) -> bool {
        self.ended.get() && self.len.get() == 0
    }

    fn fire_finish_if_settled(&self) {
        if !self.finished() {
            return;
        }
        for waker in self.finish_wakers.borrow_mut().drain(..) {
            waker.wake();
        }
        for callback in self.finish_callbacks.borrow_mut().drain(..) {
            callback();
        }
    }
}

/// The read side of a stream: chunks arrive via [`Writable::write`] on
/// the matching queue and are consumed with [`Readable::read`] /
/// [`Readable::read_async`] in FIFO order.
pub trait Readable {
    fn queue(&self) -> &Rc<Queue>;

    /// Pops the next buffered chunk without waiting.
    fn read(&self) -> Option<Chunk> {
        let q = self.queue();
        let item = q.buffer.pop();
        if item.is_some() {
            q.len.set(q.len.get() - 1);
            if q.below_high_water_mark() {
                q.fire_drain();
            }
            q.fire_end_if_settled();
            q.fire_finish_if_settled();
        }
        item
    }

    /// Registers `callback` to receive every chunk as it arrives, and
    /// switches the stream into flowing mode (§4.3 "`on_data(cb)`...
    /// subscribe"). Equivalent to calling [`start`](Self::start) after
    /// subscribing.
    fn on_data(&self, callback: impl Fn(Chunk) + 'static) {
        self.queue().data_callbacks.borrow_mut().push(Box::new(callback));
        self.start();
    }

    /// Registers `callback` to run once, the next time data becomes
    /// available to read (or the stream ends) (§4.3 "`on_readable(cb)`").
    fn on_readable(&self, callback: impl FnOnce() + 'static) {
        let q = self.queue();
        if q.len.get() > 0 || q.ended.get() {
            callback();
        } else {
            q.readable_callbacks.borrow_mut().push(Box::new(callback));
        }
    }

    /// Registers `callback` to run exactly once, when the stream has
    /// ended and its buffer has fully drained (§4.3 "`on_end(cb)`").
    fn on_end(&self, callback: impl FnOnce() + 'static) {
        let q = self.queue();
        if q.ended.get() && q.len.get() == 0 {
            callback();
        } else {
            q.end_callbacks.borrow_mut().push(Box::new(callback));
        }
    }

    /// Switches the stream into flowing mode: every buffered chunk (and
    /// every chunk pushed from now on) is delivered immediately to
    /// `on_data` subscribers instead of waiting to be `read` (§4.3
    /// "`start()`/`stop()`: switch between flowing and paused").
    fn start(&self) {
        let q = self.queue();
        q.flowing.set(true);
        q.pump_flowing();
    }

    /// Switches the stream back into paused mode: chunks accumulate in
    /// the buffer for `read`/`read_async` instead of being pushed to
    /// `on_data` subscribers.
    fn stop(&self) {
        self.queue().flowing.set(false);
    }

    fn len(&self) -> usize {
        self.queue().len.get()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the writer has called `end()` and every buffered chunk
    /// has been read.
    fn ended(&self) -> bool {
        self.queue().ended.get() && self.is_empty()
    }

    /// The diagnostic the producer ended the stream with, if any
    /// (`None` for a clean end, or while still active). Checked after
    /// [`read`](Self::read)/[`read_async`](Self::read_async) return
    /// `None` to distinguish "ended ok" from "ended with error".
    fn error(&self) -> Option<Diagnostic> {
        self.queue().terminal_error.borrow().clone()
    }

    /// Awaits the next chunk, or `None` once the stream has ended with
    /// nothing left buffered.
    fn read_async(&self) -> ReadFuture {
        ReadFuture {
            queue: self.queue().clone(),
        }
    }

    /// Pipes every chunk from this readable into `dest`, respecting
    /// `dest`'s backpressure, and ends `dest` once this readable ends
    /// (§4.3 "pipe"). If this readable ends with an error, that error is
    /// always forwarded to `dest`. If `keep_open` is `true`, a clean end
    /// is *not* forwarded (`dest` stays open for further writes by the
    /// caller); otherwise `dest` is ended too. Runs as its own fiber;
    /// returns that fiber's id so callers can [`crate::scheduler::abort`]
    /// it (`unpipe`).
    fn pipe(&self, dest: Rc<dyn Writable>, keep_open: bool) -> crate::scheduler::FiberId
    where
        Self: Sized,
    {
        let src = self.queue().clone();
        crate::scheduler::spawn(async move {
            loop {
                match (ReadFuture { queue: src.clone() }).await {
                    Some(chunk) => write_async(dest.clone(), chunk).await,
                    None => break,
                }
            }
            match src.terminal_error.borrow().clone() {
                Some(err) => dest.end_with_error(err),
                None if !keep_open => dest.end(),
                None => {}
            }
        })
    }
}

/// Future returned by [`Readable::read_async`].
pub struct ReadFuture {
    queue: Rc<Queue>,
}

impl Future for ReadFuture {
    type Output = Option<Chunk>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let q = &self.queue;
        if let Some(chunk) = q.buffer.pop() {
            q.len.set(q.len.get() - 1);
            if q.below_high_water_mark() {
                q.fire_drain();
            }
            q.fire_end_if_settled();
            q.fire_finish_if_settled();
            return Poll::Ready(Some(chunk));
        }
        if q.ended.get() {
            return Poll::Ready(None);
        }
        q.data_wakers.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}

impl Unpin for ReadFuture {}

/// The write side of a stream: [`write`](Self::write) buffers a chunk and
/// reports whether the buffer is still below its high-water mark (`true`
/// means "keep writing", `false` means "pause until drained").
pub trait Writable {
    fn queue(&self) -> &Rc<Queue>;

    /// Buffers `chunk` (or, while [`cork`](Self::cork)ed, holds it for the
    /// next [`uncork`](Self::uncork)) and returns whether the caller may
    /// keep writing without waiting.
    ///
    /// Panics if the stream has already ended (§3 Invariants: "a stream
    /// never transitions from ended back to active; no `push`/`write`
    /// after end"). A panic raised from inside a fiber is caught by the
    /// scheduler and reported as a `runtime_error` diagnostic (§4.1), the
    /// same as any other raised error.
    fn write(&self, chunk: Chunk) -> bool {
        let q = self.queue();
        assert!(!q.ended.get(), "write after end");
        if q.corked.get() > 0 {
            q.cork_buffer.borrow_mut().push_back(chunk);
            return true;
        }
        q.buffer.push(chunk);
        q.len.set(q.len.get() + 1);
        q.wake_data();
        q.fire_readable();
        q.pump_flowing();
        q.below_high_water_mark()
    }

    /// Marks the stream ended: no further writes are expected, and
    /// readers observe [`Readable::ended`] once the buffer drains.
    fn end(&self) {
        let q = self.queue();
        assert!(!q.ended.get(), "end after end");
        q.ended.set(true);
        q.wake_data();
        q.fire_readable();
        q.fire_end_if_settled();
        q.fire_finish_if_settled();
    }

    /// Marks the stream ended with a terminal error: readers observe
    /// [`Readable::error`] (after the buffer drains) instead of a clean
    /// end, and a [`pipe`](Readable::pipe) always forwards this error to
    /// its destination regardless of `keep_open`.
    fn end_with_error(&self, diagnostic: Diagnostic) {
        let q = self.queue();
        assert!(!q.ended.get(), "end after end");
        *q.terminal_error.borrow_mut() = Some(diagnostic);
        q.ended.set(true);
        q.wake_data();
        q.fire_readable();
        q.fire_end_if_settled();
        q.fire_finish_if_settled();
    }

    /// Buffers subsequent writes locally instead of publishing them.
    /// Nests: two `cork()` calls require two matching `uncork()` calls
    /// before writes resume publishing (§4.3 "nested corks are a counter").
    fn cork(&self) {
        let q = self.queue();
        q.corked.set(q.corked.get() + 1);
    }

    /// Reverses one `cork()` call. Only once the count returns to zero are
    /// the corked writes flushed and publishing resumed.
    fn uncork(&self) {
        let q = self.queue();
        let depth = q.corked.get().saturating_sub(1);
        q.corked.set(depth);
        if depth > 0 {
            return;
        }
        let mut pending = q.cork_buffer.borrow_mut();
        let flushed = !pending.is_empty();
        while let Some(chunk) = pending.pop_front() {
            q.buffer.push(chunk);
            q.len.set(q.len.get() + 1);
        }
        drop(pending);
        if flushed {
            q.wake_data();
            q.fire_readable();
            q.pump_flowing();
        }
        if q.below_high_water_mark() {
            q.fire_drain();
        }
    }

    /// Registers `callback` to run the next time the buffer drains below
    /// its high-water mark. Consumed (removed) the instant it fires —
    /// register again for subsequent drains (§9 Open Questions: `on_drain`
    /// is single-shot).
    fn on_drain(&self, callback: impl FnOnce() + 'static) {
        self.queue().drain_callbacks.borrow_mut().push(Box::new(callback));
    }

    /// True once [`end`](Self::end)/[`end_with_error`](Self::end_with_error)
    /// has been called and every buffered chunk has drained (been read).
    fn finished(&self) -> bool {
        self.queue().finished()
    }

    /// Registers `callback` to run exactly once, the moment the stream
    /// [`finished`](Self::finished). Runs immediately if already finished.
    fn on_finish(&self, callback: impl FnOnce() + 'static) {
        let q = self.queue();
        if q.finished() {
            callback();
        } else {
            q.finish_callbacks.borrow_mut().push(Box::new(callback));
        }
    }

    /// Awaits [`finished`](Self::finished).
    fn wait_finish(&self) -> FinishFuture {
        FinishFuture {
            queue: self.queue().clone(),
        }
    }
}

/// Future returned by [`Writable::wait_finish`].
pub struct FinishFuture {
    queue: Rc<Queue>,
}

impl Future for FinishFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.queue.finished() {
            return Poll::Ready(());
        }
        self.queue.finish_wakers.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}

impl Unpin for FinishFuture {}

struct DrainFuture {
    queue: Rc<Queue>,
}

impl Future for DrainFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.queue.below_high_water_mark() {
            return Poll::Ready(());
        }
        self.queue.drain_wakers.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}

impl Unpin for DrainFuture {}

/// Writes `chunk` to `dest`, awaiting a drain if backpressure applies.
pub async fn write_async(dest: Rc<dyn Writable>, chunk: Chunk) {
    if !dest.write(chunk) {
        DrainFuture {
            queue: dest.queue().clone(),
        }
        .await;
    }
}

/// A plain in-memory readable endpoint.
pub struct ReadableStream {
    queue: Rc<Queue>,
}

impl ReadableStream {
    pub fn new(high_water_mark: usize) -> Rc<Self> {
        Rc::new(ReadableStream {
            queue: Queue::new(high_water_mark),
        })
    }

    /// A readable stream at the default high-water mark (§3).
    pub fn new_default() -> Rc<Self> {
        Self::new(DEFAULT_HIGH_WATER_MARK)
    }
}

impl Readable for ReadableStream {
    fn queue(&self) -> &Rc<Queue> {
        &self.queue
    }
}

/// A plain in-memory writable endpoint.
pub struct WritableStream {
    queue: Rc<Queue>,
}

impl WritableStream {
    pub fn new(high_water_mark: usize) -> Rc<Self> {
        Rc::new(WritableStream {
            queue: Queue::new(high_water_mark),
        })
    }

    /// A writable stream at the default high-water mark (§3).
    pub fn new_default() -> Rc<Self> {
        Self::new(DEFAULT_HIGH_WATER_MARK)
    }
}

impl Writable for WritableStream {
    fn queue(&self) -> &Rc<Queue> {
        &self.queue
    }
}

/// Both a readable and a writable endpoint over independent buffers
/// (reading from one side has no effect on the other).
pub struct Duplex {
    readable: Rc<Queue>,
    writable: Rc<Queue>,
}

impl Duplex {
    pub fn new(high_water_mark: usize) -> Rc<Self> {
        Rc::new(Duplex {
            readable: Queue::new(high_water_mark),
            writable: Queue::new(high_water_mark),
        })
    }

    /// A duplex stream at the default high-water mark on both sides (§3).
    pub fn new_default() -> Rc<Self> {
        Self::new(DEFAULT_HIGH_WATER_MARK)
    }
}

impl Readable for Duplex {
    fn queue(&self) -> &Rc<Queue> {
        &self.readable
    }
}

impl Writable for Duplex {
    fn queue(&self) -> &Rc<Queue> {
        &self.writable
    }
}

/// A duplex whose readable side is fed by applying a function to chunks
/// written to its writable side, running as its own fiber for as long as
/// the transform function keeps returning output.
pub struct Transform {
    input: Rc<Queue>,
    output: Rc<Queue>,
}

impl Transform {
    /// A transform stream at the default high-water mark on both sides
    /// (§3).
    pub fn new_default<F>(transform: F) -> Rc<Self>
    where
        F: FnMut(Chunk) -> Option<Chunk> + 'static,
    {
        Self::new(DEFAULT_HIGH_WATER_MARK, transform)
    }

    pub fn new<F>(high_water_mark: usize, mut transform: F) -> Rc<Self>
    where
        F: FnMut(Chunk) -> Option<Chunk> + 'static,
    {
        let input = Queue::new(high_water_mark);
        let output = Queue::new(high_water_mark);
        let fiber_input = input.clone();
        let fiber_output = output.clone();
        crate::scheduler::spawn(async move {
            loop {
                let chunk = (ReadFuture {
                    queue: fiber_input.clone(),
                })
                .await;
                match chunk {
                    Some(chunk) => {
                        if let Some(out) = transform(chunk) {
                            fiber_output.buffer.push(out);
                            fiber_output.len.set(fiber_output.len.get() + 1);
                            fiber_output.wake_data();
                        }
                    }
                    None => break,
                }
            }
            if let Some(err) = fiber_input.terminal_error.borrow().clone() {
                *fiber_output.terminal_error.borrow_mut() = Some(err);
            }
            fiber_output.ended.set(true);
            fiber_output.wake_data();
            fiber_output.fire_finish_if_settled();
        });
        Rc::new(Transform { input, output })
    }
}

impl Readable for Transform {
    fn queue(&self) -> &Rc<Queue> {
        &self.output
    }
}

impl Writable for Transform {
    fn queue(&self) -> &Rc<Queue> {
        &self.input
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::scheduler;

    #[test]
    fn write_then_read_preserves_order() {
        let s = WritableStream::new(4);
        s.write(b"a".to_vec());
        s.write(b"b".to_vec());
        let r = ReadableStream { queue: s.queue.clone() };
        assert_eq!(r.read(), Some(b"a".to_vec()));
        assert_eq!(r.read(), Some(b"b".to_vec()));
        assert_eq!(r.read(), None);
    }

    #[test]
    fn write_reports_backpressure_at_high_water_mark() {
        let s = WritableStream::new(1);
        assert!(!s.write(b"x".to_vec()));
    }

    #[test]
    fn cork_buffers_until_uncork() {
        let s = WritableStream::new(4);
        s.cork();
        s.write(b"a".to_vec());
        let r = ReadableStream { queue: s.queue.clone() };
        assert_eq!(r.len(), 0);
        s.uncork();
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn nested_cork_requires_matching_uncork_count() {
        let s = WritableStream::new(4);
        let r = ReadableStream { queue: s.queue.clone() };
        s.cork();
        s.cork();
        s.write(b"a".to_vec());
        s.uncork();
        assert_eq!(r.len(), 0, "one matching uncork must not flush a double cork");
        s.uncork();
        assert_eq!(r.len(), 1, "the second uncork brings the depth back to zero");
    }

    #[test]
    fn pipe_forwards_all_chunks_and_ends_destination() {
        let scheduler = scheduler();
        let producer = WritableStream::new(8);
        producer.write(b"1".to_vec());
        producer.write(b"2".to_vec());
        producer.end();
        let src = ReadableStream { queue: producer.queue.clone() };
        let dest = WritableStream::new(8);
        src.pipe(dest.clone(), false);
        scheduler.run().unwrap();
        let reader = ReadableStream { queue: dest.queue.clone() };
        assert_eq!(reader.read(), Some(b"1".to_vec()));
        assert_eq!(reader.read(), Some(b"2".to_vec()));
        assert!(reader.ended());
    }

    #[test]
    fn pipe_with_keep_open_suppresses_clean_end_but_forwards_errors() {
        let scheduler = scheduler();
        let producer = WritableStream::new(8);
        producer.write(b"1".to_vec());
        producer.end();
        let src = ReadableStream { queue: producer.queue.clone() };
        let dest = WritableStream::new(8);
        src.pipe(dest.clone(), true);
        scheduler.run().unwrap();
        assert!(!dest.finished(), "keep_open must not end the destination");
        dest.write(b"more".to_vec());

        let err_producer = WritableStream::new(8);
        err_producer.end_with_error(Diagnostic::new(
            "error: pipe source failed",
            Vec::<crate::diagnostics::Value>::new(),
        ));
        let err_src = ReadableStream { queue: err_producer.queue.clone() };
        let err_dest = WritableStream::new(8);
        err_src.pipe(err_dest.clone(), true);
        scheduler.run().unwrap();
        assert!(err_dest.finished());
        let reader = ReadableStream { queue: err_dest.queue.clone() };
        assert!(reader.error().is_some());
    }

    #[test]
    #[should_panic(expected = "write after end")]
    fn write_after_end_panics() {
        let s = WritableStream::new(4);
        s.end();
        s.write(b"late".to_vec());
    }

    #[test]
    fn end_with_error_is_observed_by_the_reader() {
        let s = WritableStream::new(4);
        s.write(b"a".to_vec());
        s.end_with_error(Diagnostic::new("error: disk full", Vec::<crate::diagnostics::Value>::new()));
        let r = ReadableStream { queue: s.queue.clone() };
        assert_eq!(r.read(), Some(b"a".to_vec()));
        assert_eq!(r.read(), None);
        assert_eq!(r.error().unwrap().message(), "disk full");
    }

    #[test]
    fn wait_finish_resolves_once_buffer_drains_after_end() {
        let scheduler = scheduler();
        let s = WritableStream::new(4);
        s.write(b"a".to_vec());
        s.end();
        let finished = Rc::new(Cell::new(false));
        let finished2 = finished.clone();
        let r = ReadableStream { queue: s.queue.clone() };
        scheduler.spawn(async move {
            s.wait_finish().await;
            finished2.set(true);
        });
        // Nothing has drained the single buffered chunk yet.
        scheduler.run().unwrap();
        assert!(!finished.get());
        r.read();
        scheduler.run().unwrap();
        assert!(finished.get());
    }

    #[test]
    fn transform_maps_chunks_through_the_fiber() {
        let scheduler = scheduler();
        let transform = Transform::new(8, |chunk| {
            Some(chunk.into_iter().map(|b| b.to_ascii_uppercase()).collect())
        });
        transform.write(b"ab".to_vec());
        transform.end();
        scheduler.run().unwrap();
        assert_eq!(transform.read(), Some(b"AB".to_vec()));
        assert!(transform.ended());
    }

    #[test]
    fn on_data_switches_to_flowing_and_delivers_already_buffered_chunks() {
        let s = WritableStream::new(8);
        s.write(b"a".to_vec());
        s.write(b"b".to_vec());
        let r = ReadableStream { queue: s.queue.clone() };
        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = received.clone();
        r.on_data(move |chunk| received2.borrow_mut().push(chunk));
        assert_eq!(*received.borrow(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(r.len(), 0, "flowing mode must drain the buffer");
    }

    #[test]
    fn on_data_delivers_chunks_written_after_subscribing() {
        let s = WritableStream::new(8);
        let r = ReadableStream { queue: s.queue.clone() };
        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = received.clone();
        r.on_data(move |chunk| received2.borrow_mut().push(chunk));
        s.write(b"x".to_vec());
        s.write(b"y".to_vec());
        assert_eq!(*received.borrow(), vec![b"x".to_vec(), b"y".to_vec()]);
    }

    #[test]
    fn stop_pauses_flowing_delivery_until_start_is_called_again() {
        let s = WritableStream::new(8);
        let r = ReadableStream { queue: s.queue.clone() };
        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = received.clone();
        r.on_data(move |chunk| received2.borrow_mut().push(chunk));
        r.stop();
        s.write(b"buffered".to_vec());
        assert!(received.borrow().is_empty());
        assert_eq!(r.len(), 1);
        r.start();
        assert_eq!(*received.borrow(), vec![b"buffered".to_vec()]);
    }

    #[test]
    fn on_readable_fires_once_when_data_is_already_available() {
        let s = WritableStream::new(8);
        s.write(b"a".to_vec());
        let r = ReadableStream { queue: s.queue.clone() };
        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        r.on_readable(move || fired2.set(fired2.get() + 1));
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn on_readable_fires_once_when_data_arrives_later() {
        let s = WritableStream::new(8);
        let r = ReadableStream { queue: s.queue.clone() };
        let fired = Rc::new(Cell::new(0));
        let fired2 = fired.clone();
        r.on_readable(move || fired2.set(fired2.get() + 1));
        assert_eq!(fired.get(), 0);
        s.write(b"a".to_vec());
        assert_eq!(fired.get(), 1);
        s.write(b"b".to_vec());
        assert_eq!(fired.get(), 1, "on_readable is single-shot");
    }

    #[test]
    fn on_end_fires_once_the_buffer_has_fully_drained_past_end() {
        let s = WritableStream::new(8);
        s.write(b"a".to_vec());
        let r = ReadableStream { queue: s.queue.clone() };
        let ended = Rc::new(Cell::new(false));
        let ended2 = ended.clone();
        r.on_end(move || ended2.set(true));
        s.end();
        assert!(!ended.get(), "chunk is still buffered and unread");
        r.read();
        assert!(ended.get());
    }

    #[test]
    fn on_end_fires_immediately_when_already_ended_and_drained() {
        let s = WritableStream::new(8);
        s.end();
        let r = ReadableStream { queue: s.queue.clone() };
        let ended = Rc::new(Cell::new(false));
        let ended2 = ended.clone();
        r.on_end(move || ended2.set(true));
        assert!(ended.get());
    }

    #[test]
    fn uncork_delivers_flushed_chunks_to_flowing_subscribers() {
        let s = WritableStream::new(8);
        let r = ReadableStream { queue: s.queue.clone() };
        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = received.clone();
        r.on_data(move |chunk| received2.borrow_mut().push(chunk));
        s.cork();
        s.write(b"a".to_vec());
        s.write(b"b".to_vec());
        assert!(received.borrow().is_empty(), "corked writes stay buffered");
        s.uncork();
        assert_eq!(*received.borrow(), vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
