//! Bounded FIFO ring buffer shared by the event log, metric history, and
//! process-change tracking.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Fixed-capacity FIFO. `push` evicts the oldest entry once full; readers
/// only ever receive copies, so there is no iteration protocol to misuse
/// across threads.
pub struct RingBuffer<T: Clone> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Panics when `capacity` is zero; a zero-length ring has no meaningful
    /// eviction order.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be > 0");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, value: T) {
        let mut buf = self.inner.lock();
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(value);
    }

    /// Last `min(n, len)` entries in chronological order, as a fresh copy.
    pub fn recent(&self, n: usize) -> Vec<T> {
        let buf = self.inner.lock();
        let skip = buf.len().saturating_sub(n);
        buf.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_recent_order() {
        let ring = RingBuffer::new(10);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.recent(3), vec![2, 3, 4]);
        assert_eq!(ring.recent(100), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_eviction_at_capacity() {
        let ring = RingBuffer::new(3);
        for i in 0..4 {
            ring.push(i);
        }
        // Pushing N+1 into capacity N leaves N entries, oldest is the second push.
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.recent(3), vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_ring() {
        let ring: RingBuffer<u32> = RingBuffer::new(4);
        assert!(ring.is_empty());
        assert!(ring.recent(10).is_empty());
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_rejected() {
        let _ = RingBuffer::<u32>::new(0);
    }

    #[test]
    fn test_concurrent_push_and_read() {
        use std::sync::Arc;
        let ring = Arc::new(RingBuffer::new(64));
        let writer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    ring.push(i);
                }
            })
        };
        for _ in 0..100 {
            let snap = ring.recent(64);
            assert!(snap.len() <= 64);
            // Copies must stay chronologically ordered mid-write.
            assert!(snap.windows(2).all(|w| w[0] < w[1]));
        }
        writer.join().unwrap();
        assert_eq!(ring.len(), 64);
    }
}
