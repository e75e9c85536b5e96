//! Bounded, single-producer/single-consumer staging buffer (C1).
//!
//! Decouples the connection manager from a downstream worker. The pipeline
//! instantiates two independent instances — one feeding the analytics
//! worker, one feeding the storage worker — so that every reading reaches
//! both consumers exactly once (see DESIGN.md, Open Question 2).

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::GatewayError;

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    shutdown: bool,
}

/// A bounded FIFO guarded by one mutex and two condition variables
/// (not-full, not-empty). Clone to share between exactly one producer
/// thread and one consumer thread; internally reference-counted.
pub struct StagingBuffer<T> {
    state: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> StagingBuffer<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "staging buffer capacity must be positive");
        Arc::new(Self {
            state: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                shutdown: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        })
    }

    /// Block while full, then enqueue. Returns `BufferShutdown` if shutdown
    /// has already been asserted (checked before blocking and again after
    /// each wake).
    pub fn insert(&self, item: T) -> Result<(), GatewayError> {
        let mut guard = self.state.lock();
        loop {
            if guard.shutdown {
                return Err(GatewayError::BufferShutdown);
            }
            if guard.items.len() < guard.capacity {
                break;
            }
            self.not_full.wait(&mut guard);
        }
        guard.items.push_back(item);
        drop(guard);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block while empty, then dequeue. Returns `BufferShutdown` only once
    /// the buffer is both shut down and drained — pending items are always
    /// delivered first.
    pub fn remove(&self) -> Result<T, GatewayError> {
        let mut guard = self.state.lock();
        loop {
            if let Some(item) = guard.items.pop_front() {
                drop(guard);
                self.not_full.notify_one();
                return Ok(item);
            }
            if guard.shutdown {
                return Err(GatewayError::BufferShutdown);
            }
            self.not_empty.wait(&mut guard);
        }
    }

    /// Idempotent. Wakes every waiter on both conditions; no further
    /// `insert` succeeds, but pending items still drain via `remove`.
    pub fn signal_shutdown(&self) {
        let mut guard = self.state.lock();
        guard.shutdown = true;
        drop(guard);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn sb1_count_and_capacity_invariant() {
        let buf = StagingBuffer::new(4);
        for i in 0..4 {
            buf.insert(i).unwrap();
        }
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.capacity(), 4);
        buf.remove().unwrap();
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn sb2_fifo_order_preserved_under_contention() {
        let buf = StagingBuffer::new(3);
        let producer_buf = buf.clone();
        let n = 200;

        let producer = thread::spawn(move || {
            for i in 0..n {
                producer_buf.insert(i).unwrap();
            }
        });

        let mut received = Vec::with_capacity(n);
        for _ in 0..n {
            received.push(buf.remove().unwrap());
        }
        producer.join().unwrap();

        let expected: Vec<i32> = (0..n as i32).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn sb3_shutdown_drains_pending_then_reports_shutdown() {
        let buf = StagingBuffer::new(5);
        buf.insert(1).unwrap();
        buf.insert(2).unwrap();
        buf.signal_shutdown();

        // insert fails immediately once shutdown is asserted
        assert!(matches!(buf.insert(3), Err(GatewayError::BufferShutdown)));

        // pending items still drain
        assert_eq!(buf.remove().unwrap(), 1);
        assert_eq!(buf.remove().unwrap(), 2);
        // only once empty does remove report shutdown
        assert!(matches!(buf.remove(), Err(GatewayError::BufferShutdown)));
    }

    #[test]
    fn blocked_remove_is_woken_by_shutdown() {
        let buf: Arc<StagingBuffer<i32>> = StagingBuffer::new(2);
        let waiter = buf.clone();
        let handle = thread::spawn(move || waiter.remove());

        thread::sleep(Duration::from_millis(50));
        buf.signal_shutdown();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(GatewayError::BufferShutdown)));
    }

    #[test]
    fn blocked_insert_is_woken_by_consumer() {
        let buf = StagingBuffer::new(1);
        buf.insert(1).unwrap();

        let producer_buf = buf.clone();
        let handle = thread::spawn(move || producer_buf.insert(2));

        thread::sleep(Duration::from_millis(20));
        assert_eq!(buf.remove().unwrap(), 1);
        handle.join().unwrap().unwrap();
        assert_eq!(buf.remove().unwrap(), 2);
    }

    #[test]
    fn signal_shutdown_is_idempotent() {
        let buf: Arc<StagingBuffer<i32>> = StagingBuffer::new(2);
        buf.signal_shutdown();
        buf.signal_shutdown();
        assert!(buf.is_shutdown());
        assert!(matches!(buf.remove(), Err(GatewayError::BufferShutdown)));
    }
}
