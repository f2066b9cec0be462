//! Bounded FIFO with timed push and pop.
//!
//! Both ends block for at most the given timeout, so worker threads can
//! observe a stop signal between attempts instead of parking forever.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use teleop_kernel::lock_recover;

/// Default capacity of a session queue.
pub const DEFAULT_CAPACITY: usize = 64;

/// Default time an enqueue may block before giving up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

/// A multi-producer, multi-consumer bounded queue.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
    drained: Condvar,
}

impl<T> BoundedQueue<T> {
    /// A queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        lock_recover(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `item`, waiting up to `timeout` for room.
    ///
    /// On timeout the item is handed back in `Err`.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut items = lock_recover(&self.items);
        while items.len() >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                return Err(item);
            }
            items = match self.not_full.wait_timeout(items, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = lock_recover(&self.items);
        loop {
            if let Some(item) = items.pop_front() {
                let empty = items.is_empty();
                drop(items);
                self.not_full.notify_one();
                if empty {
                    self.drained.notify_all();
                }
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            items = match self.not_empty.wait_timeout(items, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Discard every queued item; returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut items = lock_recover(&self.items);
        let dropped = items.len();
        items.clear();
        drop(items);
        self.not_full.notify_all();
        self.drained.notify_all();
        dropped
    }

    /// Wait up to `timeout` for consumers to take every queued item.
    ///
    /// Returns whether the queue is empty.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut items = lock_recover(&self.items);
        while !items.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            items = match self.drained.wait_timeout(items, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
