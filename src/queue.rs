use parking_lot::Mutex;
use std::collections::VecDeque;

/// A cache access observed on the wire: the key plus the size of the
/// associated value (0 for request-side events the decoder chooses not to
/// size, per the default response-only counting policy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub key: Vec<u8>,
    pub size: u32,
}

impl Event {
    pub fn new(key: Vec<u8>, size: u32) -> Self {
        Event { key, size }
    }
}

/// Bounded FIFO carrying events from the capture thread to the collector.
/// Single producer / single consumer is the required minimum; the internal
/// mutex makes it safe to generalize to more of either without changing the
/// contract. Full queues drop silently: the aggregator is already sampling,
/// so a dropped event is an acceptable loss rather than a fatal condition.
pub struct EventQueue {
    inner: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        EventQueue { inner: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    /// Enqueues `event` if space exists. Returns false (and drops the event)
    /// if the queue is full.
    pub fn produce(&self, event: Event) -> bool {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            return false;
        }
        q.push_back(event);
        true
    }

    /// Non-blocking dequeue. Returns `None` if the queue is empty.
    pub fn consume(&self) -> Option<Event> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
