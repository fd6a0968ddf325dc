//! Bounded blocking hand-off between one producer (a backend read thread)
//! and one consumer (the session's drain thread).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use shardgate_common::error::MergeError;

use crate::item::HeapItem;

struct QueueState {
    items: VecDeque<HeapItem>,
    closed: bool,
    peak: usize,
}

pub struct BoundedRowQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_full: Condvar,
    not_empty: Condvar,
    blocked_puts: AtomicU64,
}

impl BoundedRowQueue {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
                peak: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            blocked_puts: AtomicU64::new(0),
        }
    }

    /// Enqueue, blocking while the queue is full. Fails with
    /// `MergeError::Interrupted` once the queue is closed.
    pub fn put(&self, item: HeapItem) -> Result<(), MergeError> {
        let mut state = self.state.lock();
        if !state.closed && state.items.len() >= self.capacity {
            self.blocked_puts.fetch_add(1, Ordering::Relaxed);
            shardgate_observability::record_merge_backpressure();
            while !state.closed && state.items.len() >= self.capacity {
                self.not_full.wait(&mut state);
            }
        }
        if state.closed {
            return Err(MergeError::Interrupted);
        }
        state.items.push_back(item);
        state.peak = state.peak.max(state.items.len());
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue, blocking while the queue is empty. Fails with
    /// `MergeError::Interrupted` once the queue is closed, even if items remain.
    pub fn take(&self) -> Result<HeapItem, MergeError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(MergeError::Interrupted);
            }
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Ok(item);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Wake every blocked `put`/`take` and refuse further traffic.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Drop queued items; returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.items.len();
        state.items.clear();
        self.not_full.notify_all();
        n
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Highest number of items ever held at once.
    pub fn peak_len(&self) -> usize {
        self.state.lock().peak
    }

    /// Number of `put` calls that had to wait for space.
    pub fn blocked_puts(&self) -> u64 {
        self.blocked_puts.load(Ordering::Relaxed)
    }
}
