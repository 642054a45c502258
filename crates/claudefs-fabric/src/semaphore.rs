//! Counting semaphore used to wake the event consumer.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// A counting semaphore with deadline-bounded waits.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u64>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` counts.
    pub fn new(initial: u64) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Adds one count and wakes a waiter.
    pub fn up(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Takes one count if available without blocking.
    pub fn try_down(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Takes one count, blocking until `deadline`. Returns false on timeout.
    pub fn timed_down(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                if *count == 0 {
                    return false;
                }
                break;
            }
        }
        *count -= 1;
        true
    }

    /// Current count.
    pub fn value(&self) -> u64 {
        *self.count.lock()
    }
}
