//! Bounded reassembly queue between the receiver and the consumer.
//!
//! Two layers:
//! - [`RingQueue`]: a plain fixed-capacity circular buffer of segments.
//!   Every operation is non-blocking and reports success or failure.
//! - [`ReassemblyQueue`]: the shareable wrapper used at runtime.  One
//!   producer (the receive loop) and one consumer (the consumer task) go
//!   through a single mutex; idle sides park on [`tokio::sync::Notify`]
//!   rather than spinning.  The lock is never held across an `.await`.
//!
//! The queue only ever holds in-order segments; the receive loop refuses
//! anything else before it gets here.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::packet::Segment;

// ---------------------------------------------------------------------------
// RingQueue
// ---------------------------------------------------------------------------

/// Fixed-capacity circular buffer.
///
/// `front` is the slot of the oldest element and `rear` the slot of the
/// newest; both are meaningful only while `size > 0`.
#[derive(Debug)]
pub struct RingQueue {
    slots: Vec<Option<Segment>>,
    front: usize,
    rear: usize,
    size: usize,
}

impl RingQueue {
    /// Create an empty queue holding at most `capacity` segments (≥ 1).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "capacity must be at least 1");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            front: 0,
            rear: capacity - 1,
            size: 0,
        }
    }

    /// Append `segment` at the rear.  Returns `false` (dropping the segment)
    /// when the queue is full.
    pub fn try_enqueue(&mut self, segment: Segment) -> bool {
        if self.is_full() {
            return false;
        }
        self.rear = (self.rear + 1) % self.capacity();
        self.slots[self.rear] = Some(segment);
        self.size += 1;
        true
    }

    /// Remove and return the oldest segment, or `None` when empty.
    pub fn try_dequeue(&mut self) -> Option<Segment> {
        if self.is_empty() {
            return None;
        }
        let segment = self.slots[self.front].take();
        self.front = (self.front + 1) % self.capacity();
        self.size -= 1;
        segment
    }

    /// Borrow the oldest segment without removing it.
    pub fn front(&self) -> Option<&Segment> {
        if self.is_empty() {
            None
        } else {
            self.slots[self.front].as_ref()
        }
    }

    /// Number of free slots.
    pub fn free_space(&self) -> usize {
        self.capacity() - self.size
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.size == self.capacity()
    }
}

// ---------------------------------------------------------------------------
// ReassemblyQueue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Inner {
    ring: RingQueue,
    closed: bool,
    high_water: usize,
}

/// Thread-safe reassembly queue shared by the receive loop and the consumer.
#[derive(Debug)]
pub struct ReassemblyQueue {
    inner: Mutex<Inner>,
    /// Signalled after an enqueue or [`close`](Self::close).
    readable: Notify,
    /// Signalled after a dequeue frees a slot.
    writable: Notify,
}

impl ReassemblyQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: RingQueue::new(capacity),
                closed: false,
                high_water: 0,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking enqueue.  Returns `false` when the queue is full or
    /// already closed.
    pub fn try_enqueue(&self, segment: Segment) -> bool {
        let accepted = {
            let mut inner = self.lock();
            if inner.closed {
                false
            } else {
                let ok = inner.ring.try_enqueue(segment);
                inner.high_water = inner.high_water.max(inner.ring.len());
                ok
            }
        };
        if accepted {
            self.readable.notify_one();
        }
        accepted
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Option<Segment> {
        let segment = self.lock().ring.try_dequeue();
        if segment.is_some() {
            self.writable.notify_one();
        }
        segment
    }

    pub fn free_space(&self) -> usize {
        self.lock().ring.free_space()
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().ring.capacity()
    }

    /// Largest number of segments ever held at once.
    pub fn high_water_mark(&self) -> usize {
        self.lock().high_water
    }

    /// Mark the end of the stream.  Further enqueues are refused; the
    /// consumer finishes once it has drained what is left.
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// `true` once the queue is closed and nothing remains to consume.
    pub fn is_drained(&self) -> bool {
        let inner = self.lock();
        inner.closed && inner.ring.is_empty()
    }

    /// Wait until something was enqueued or the queue was closed.
    ///
    /// Wakeups are stored as a permit, so a signal sent between a failed
    /// `try_dequeue` and this call is not lost.
    pub async fn readable(&self) {
        self.readable.notified().await;
    }

    /// Wait until the consumer has freed at least one slot.
    pub async fn writable(&self) {
        self.writable.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn seg(seq: u32) -> Segment {
        Segment::data(seq, 0, vec![seq as u8])
    }

    #[test]
    fn ring_starts_empty() {
        let mut q = RingQueue::new(3);
        assert!(q.is_empty());
        assert_eq!(q.free_space(), 3);
        assert!(q.try_dequeue().is_none());
        assert!(q.front().is_none());
    }

    #[test]
    fn ring_preserves_fifo_order() {
        let mut q = RingQueue::new(3);
        assert!(q.try_enqueue(seg(1)));
        assert!(q.try_enqueue(seg(2)));
        assert_eq!(q.front().map(|s| s.header.seq), Some(1));
        assert_eq!(q.try_dequeue().map(|s| s.header.seq), Some(1));
        assert_eq!(q.try_dequeue().map(|s| s.header.seq), Some(2));
        assert!(q.try_dequeue().is_none());
    }

    #[test]
    fn ring_rejects_when_full() {
        let mut q = RingQueue::new(2);
        assert!(q.try_enqueue(seg(1)));
        assert!(q.try_enqueue(seg(2)));
        assert!(q.is_full());
        assert!(!q.try_enqueue(seg(3)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.free_space(), 0);
    }

    #[test]
    fn ring_wraps_around_many_times() {
        let mut q = RingQueue::new(3);
        for round in 0..10u32 {
            assert!(q.try_enqueue(seg(round * 2)));
            assert!(q.try_enqueue(seg(round * 2 + 1)));
            assert_eq!(q.try_dequeue().map(|s| s.header.seq), Some(round * 2));
            assert_eq!(q.try_dequeue().map(|s| s.header.seq), Some(round * 2 + 1));
            assert!(q.len() <= q.capacity());
        }
        assert!(q.is_empty());
    }

    #[test]
    #[should_panic(expected = "capacity must be at least 1")]
    fn ring_rejects_zero_capacity() {
        let _ = RingQueue::new(0);
    }

    #[test]
    fn shared_queue_tracks_high_water_mark() {
        let q = ReassemblyQueue::new(4);
        assert!(q.try_enqueue(seg(1)));
        assert!(q.try_enqueue(seg(2)));
        assert!(q.try_enqueue(seg(3)));
        q.try_dequeue();
        q.try_dequeue();
        assert!(q.try_enqueue(seg(4)));
        assert_eq!(q.high_water_mark(), 3);
        assert_eq!(q.free_space(), 2);
    }

    #[test]
    fn closed_queue_refuses_and_drains() {
        let q = ReassemblyQueue::new(2);
        assert!(q.try_enqueue(seg(1)));
        assert!(!q.is_closed());
        q.close();
        assert!(q.is_closed());
        assert!(!q.try_enqueue(seg(2)));
        assert!(!q.is_drained());
        assert!(q.try_dequeue().is_some());
        assert!(q.is_drained());
    }

    #[tokio::test]
    async fn readable_wakes_parked_consumer() {
        let q = Arc::new(ReassemblyQueue::new(2));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                loop {
                    if let Some(s) = q.try_dequeue() {
                        return s.header.seq;
                    }
                    q.readable().await;
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(q.try_enqueue(seg(9)));
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer never woke")
            .unwrap();
        assert_eq!(got, 9);
    }

    #[tokio::test]
    async fn signal_before_wait_is_not_lost() {
        let q = ReassemblyQueue::new(1);
        assert!(q.try_enqueue(seg(1)));
        // The permit stored by the enqueue lets this return immediately.
        tokio::time::timeout(Duration::from_millis(100), q.readable())
            .await
            .expect("stored wakeup was lost");
    }
}
