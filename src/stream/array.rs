//! Bridges an in-memory list of chunks to and from the streaming
//! interfaces (§4.3 "Array adapters: `from_array`/`to_array`").
use std::time::Duration;

use std::rc::Rc;

use super::{Chunk, Queue, Readable, Writable, DEFAULT_HIGH_WATER_MARK};

/// A readable preloaded with `items`. With no delay, it is already ended
/// on construction — draining it is synchronous and never blocks on
/// backpressure. With a delay, items are pushed one at a time on a timer
/// instead (§4.3 "with a non-zero `delay`, items are pushed asynchronously
/// on a timer"), so a consumer observes genuine backpressure and ordering
/// the same way it would from a live producer.
pub struct ArrayReadable {
    queue: Rc<Queue>,
}

impl ArrayReadable {
    /// Preloads every item synchronously and ends the stream immediately.
    pub fn new(items: Vec<Chunk>) -> Rc<Self> {
        let queue = Queue::new(items.len().max(1));
        let adapter = Adapter(&queue);
        for item in items {
            adapter.write(item);
        }
        adapter.end();
        Rc::new(ArrayReadable { queue })
    }

    /// Pushes `items` one at a time, waiting `delay` between each, as its
    /// own fiber. Honors the destination's backpressure signal the same
    /// way a real producer would (§4.3 "push... Returns true iff producer
    /// should continue").
    pub fn new_delayed(items: Vec<Chunk>, delay: Duration) -> Rc<Self> {
        let queue = Queue::new(DEFAULT_HIGH_WATER_MARK);
        let fiber_queue = queue.clone();
        crate::scheduler::spawn(async move {
            let writer: Rc<dyn Writable> = Rc::new(OwnedAdapter(fiber_queue));
            for item in items {
                if !delay.is_zero() {
                    crate::scheduler::sleep(delay).await;
                }
                super::write_async(writer.clone(), item).await;
            }
            writer.end();
        });
        Rc::new(ArrayReadable { queue })
    }
}

impl Readable for ArrayReadable {
    fn queue(&self) -> &Rc<Queue> {
        &self.queue
    }
}

struct Adapter<'a>(&'a Rc<Queue>);
impl<'a> Writable for Adapter<'a> {
    fn queue(&self) -> &Rc<Queue> {
        self.0
    }
}

/// An owned variant of [`Adapter`], needed where the write side must
/// outlive a single borrow (e.g. across `.await` points in a spawned
/// fiber).
struct OwnedAdapter(Rc<Queue>);
impl Writable for OwnedAdapter {
    fn queue(&self) -> &Rc<Queue> {
        &self.0
    }
}

/// Builds a readable from a plain `Vec` of chunks, yielding them all
/// synchronously (no delay).
pub fn from_array(items: Vec<Chunk>) -> Rc<ArrayReadable> {
    ArrayReadable::new(items)
}

/// Builds a readable that pushes `items` one at a time, `delay` apart, on
/// a timer (§4.3 "from_array(list, delay?)").
pub fn from_array_delayed(items: Vec<Chunk>, delay: Duration) -> Rc<ArrayReadable> {
    ArrayReadable::new_delayed(items, delay)
}

/// Drains `readable` into a `Vec`, awaiting each chunk in turn until the
/// stream ends.
pub async fn to_array<R: Readable>(readable: &R) -> Vec<Chunk> {
    let mut items = Vec::new();
    while let Some(chunk) = readable.read_async().await {
        items.push(chunk);
    }
    items
}

/// Drains `readable` into a `Vec`, waiting `delay` before consuming each
/// chunk (§4.3 "to_array(list, delay?)"), so a slow sink can be simulated
/// without a real I/O backend.
pub async fn to_array_delayed<R: Readable>(readable: &R, delay: Duration) -> Vec<Chunk> {
    let mut items = Vec::new();
    while let Some(chunk) = readable.read_async().await {
        if !delay.is_zero() {
            crate::scheduler::sleep(delay).await;
        }
        items.push(chunk);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::scheduler;

    #[test]
    fn round_trips_through_the_stream_interfaces() {
        let sched = scheduler();
        let readable = from_array(vec![b"a".to_vec(), b"b".to_vec()]);
        let collected = Rc::new(std::cell::RefCell::new(Vec::new()));
        let collected2 = collected.clone();
        let r = readable.clone();
        sched.spawn(async move {
            let items = to_array(&*r).await;
            *collected2.borrow_mut() = items;
        });
        sched.run().unwrap();
        assert_eq!(*collected.borrow(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn delayed_from_array_preserves_order() {
        let sched = scheduler();
        let readable = from_array_delayed(
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()],
            Duration::from_millis(1),
        );
        let collected = Rc::new(std::cell::RefCell::new(Vec::new()));
        let collected2 = collected.clone();
        let r = readable.clone();
        sched.spawn(async move {
            *collected2.borrow_mut() = to_array(&*r).await;
        });
        sched.run().unwrap();
        assert_eq!(
            *collected.borrow(),
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]
        );
    }

    #[test]
    fn delayed_to_array_still_collects_everything() {
        let sched = scheduler();
        let readable = from_array(vec![b"a".to_vec(), b"b".to_vec()]);
        let collected = Rc::new(std::cell::RefCell::new(Vec::new()));
        let collected2 = collected.clone();
        let r = readable.clone();
        sched.spawn(async move {
            *collected2.borrow_mut() = to_array_delayed(&*r, Duration::from_millis(1)).await;
        });
        sched.run().unwrap();
        assert_eq!(*collected.borrow(), vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
