//! Bounded buffer of macropulse arrays between the acquisition thread and the
//! spectrum thread.
//!
//! Capacity is fixed when the buffer is built. What happens at capacity depends on
//! the [`Eviction`] policy:
//! * `SnapshotAndClear`: appends past capacity are refused (and counted), the
//!   consumer takes the whole window in one go only when it is exactly full.
//! * `DropOldest`: a ring; each append past capacity evicts the oldest entry and
//!   the consumer copies the contents without draining, so windows overlap.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tracing::trace;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eviction {
    SnapshotAndClear,
    DropOldest,
}

pub struct WindowBuffer<T> {
    entries: Mutex<VecDeque<T>>,
    capacity: usize,
    eviction: Eviction,
    overruns: AtomicU64,
}

impl<T: Clone> WindowBuffer<T> {
    pub fn new(capacity: usize, eviction: Eviction) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("window capacity must be at least one batch".into()));
        }
        Ok(Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            eviction,
            overruns: AtomicU64::new(0),
        })
    }

    /// Capacity for `averages` segments of `segment_length` samples, fed
    /// `batch_length` samples at a time (floor division)
    pub fn with_geometry(
        segment_length: usize,
        averages: usize,
        batch_length: usize,
        eviction: Eviction,
    ) -> Result<Self> {
        if batch_length == 0 {
            return Err(Error::Config("batch length must be non-zero".into()));
        }
        Self::new(segment_length * averages / batch_length, eviction)
    }

    /// Returns false if the entry was refused because a full window is waiting
    pub fn push(&self, entry: T) -> bool {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            match self.eviction {
                Eviction::DropOldest => {
                    entries.pop_front();
                }
                Eviction::SnapshotAndClear => {
                    self.overruns.fetch_add(1, Ordering::Relaxed);
                    trace!("Window full and not yet drained, dropping batch");
                    return false;
                }
            }
        }
        entries.push_back(entry);
        true
    }

    /// Drain the buffer, but only if it holds exactly `capacity` entries
    pub fn take_if_full(&self) -> Option<Vec<T>> {
        let mut entries = self.entries.lock();
        if entries.len() != self.capacity {
            return None;
        }
        Some(entries.drain(..).collect())
    }

    /// Copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn eviction(&self) -> Eviction {
        self.eviction
    }

    /// Batches refused while a full window was waiting to be drained
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_geometry() {
        let buf = WindowBuffer::<Vec<i16>>::with_geometry(16_000, 8, 500, Eviction::DropOldest)
            .unwrap();
        assert_eq!(buf.capacity(), 256);
        // Rounds down
        let buf = WindowBuffer::<Vec<i16>>::with_geometry(1000, 3, 700, Eviction::DropOldest)
            .unwrap();
        assert_eq!(buf.capacity(), 4);
        assert!(WindowBuffer::<u8>::with_geometry(100, 1, 500, Eviction::DropOldest).is_err());
    }

    #[test]
    fn test_ring_never_exceeds_capacity() {
        let buf = WindowBuffer::new(4, Eviction::DropOldest).unwrap();
        for i in 0..10 {
            assert!(buf.push(i));
            assert!(buf.len() <= 4);
        }
        assert_eq!(buf.snapshot(), vec![6, 7, 8, 9]);
        // Snapshots don't drain
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_snapshot_and_clear_refuses_overflow() {
        let buf = WindowBuffer::new(3, Eviction::SnapshotAndClear).unwrap();
        assert!(buf.take_if_full().is_none());
        for i in 0..3 {
            assert!(buf.push(i));
        }
        assert!(!buf.push(99));
        assert_eq!(buf.overruns(), 1);
        assert_eq!(buf.take_if_full(), Some(vec![0, 1, 2]));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_consumer_only_sees_full_windows() {
        let capacity = 8;
        let buf = Arc::new(WindowBuffer::new(capacity, Eviction::SnapshotAndClear).unwrap());
        let producer = {
            let buf = buf.clone();
            thread::spawn(move || {
                for i in 0..5_000i16 {
                    buf.push(vec![i; crate::SAMPLES_PER_BATCH]);
                }
            })
        };
        let mut windows = 0;
        while !producer.is_finished() || buf.is_full() {
            if let Some(window) = buf.take_if_full() {
                let flat: Vec<i16> = window.into_iter().flatten().collect();
                assert_eq!(flat.len(), capacity * crate::SAMPLES_PER_BATCH);
                windows += 1;
            }
        }
        producer.join().unwrap();
        assert!(windows > 0);
        assert!(buf.len() <= capacity);
    }

    #[test]
    fn test_ring_under_concurrency() {
        let buf = Arc::new(WindowBuffer::new(16, Eviction::DropOldest).unwrap());
        let producer = {
            let buf = buf.clone();
            thread::spawn(move || {
                for i in 0..20_000u32 {
                    buf.push(i);
                }
            })
        };
        while !producer.is_finished() {
            let snap = buf.snapshot();
            assert!(snap.len() <= 16);
            // Insertion order survives eviction
            assert!(snap.windows(2).all(|w| w[0] + 1 == w[1]));
        }
        producer.join().unwrap();
        assert_eq!(buf.snapshot(), (19_984..20_000).collect::<Vec<_>>());
    }
}
