//! Fixed-capacity single-producer/single-consumer ring buffer.
//!
//! Positions are monotonic 64-bit counters; the slot index is the position
//! masked by capacity. The queue is full when `ipos - rpos >= mask` and
//! empty when the positions are equal.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

/// SPSC ring buffer.
///
/// Exactly one thread may insert and exactly one thread may remove. The
/// device thread is the producer of every completion ring; the polling
/// caller is the consumer.
pub struct RingBuffer<T> {
    cells: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: u64,
    ipos: AtomicU64,
    rpos: AtomicU64,
}

unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Create a ring with at least `capacity` usable slots.
    pub fn new(capacity: usize) -> Self {
        let cells = (capacity + 1).next_power_of_two();
        Self {
            cells: (0..cells)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            mask: cells as u64 - 1,
            ipos: AtomicU64::new(0),
            rpos: AtomicU64::new(0),
        }
    }

    /// Insert without blocking; hands the value back when full.
    pub fn try_insert(&self, value: T) -> Result<(), T> {
        let ipos = self.ipos.load(Ordering::Relaxed);
        let rpos = self.rpos.load(Ordering::Acquire);

        if ipos - rpos >= self.mask {
            return Err(value);
        }

        let idx = (ipos & self.mask) as usize;
        unsafe { (*self.cells[idx].get()).write(value) };
        self.ipos.store(ipos + 1, Ordering::Release);
        Ok(())
    }

    /// Insert, busy-waiting with a CPU pause while the ring is full.
    pub fn insert(&self, value: T) {
        let mut value = value;
        loop {
            match self.try_insert(value) {
                Ok(()) => return,
                Err(v) => {
                    value = v;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Remove the oldest element, if any.
    pub fn remove(&self) -> Option<T> {
        let rpos = self.rpos.load(Ordering::Relaxed);
        let ipos = self.ipos.load(Ordering::Acquire);

        if ipos == rpos {
            return None;
        }

        let idx = (rpos & self.mask) as usize;
        let value = unsafe { (*self.cells[idx].get()).assume_init_read() };
        self.rpos.store(rpos + 1, Ordering::Release);
        Some(value)
    }

    /// Number of elements currently queued.
    pub fn len(&self) -> usize {
        let rpos = self.rpos.load(Ordering::Acquire);
        let ipos = self.ipos.load(Ordering::Acquire);
        (ipos - rpos) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        while self.remove().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let rb = RingBuffer::new(8);
        for i in 0..5 {
            rb.try_insert(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rb.remove(), Some(i));
        }
        assert_eq!(rb.remove(), None);
    }

    #[test]
    fn test_capacity_bound() {
        let rb = RingBuffer::new(4);
        let mut inserted = 0usize;
        while rb.try_insert(inserted).is_ok() {
            inserted += 1;
        }
        // never more successful inserts than usable slots
        assert!(inserted >= 4);
        assert_eq!(rb.len(), inserted);

        assert_eq!(rb.remove(), Some(0));
        rb.try_insert(99).unwrap();
        assert!(rb.try_insert(100).is_err());
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let rb = RingBuffer::new(2);
        for round in 0..100u64 {
            rb.try_insert(round * 2).unwrap();
            rb.try_insert(round * 2 + 1).unwrap();
            assert_eq!(rb.remove(), Some(round * 2));
            assert_eq!(rb.remove(), Some(round * 2 + 1));
        }
    }

    #[test]
    fn test_two_threads() {
        use std::sync::Arc;

        let rb = Arc::new(RingBuffer::new(16));
        let producer = {
            let rb = rb.clone();
            std::thread::spawn(move || {
                for i in 0..10_000u64 {
                    rb.insert(i);
                }
            })
        };

        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(v) = rb.remove() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();
    }
}
