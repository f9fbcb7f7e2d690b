//! Counting semaphore used by the queues, the action heap and the vsync signal

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            permits: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Release one permit, waking a single waiter.
    pub fn post(&self) {
        *self.permits() += 1;
        self.available.notify_one();
    }

    /// Block until a permit is available and take it.
    pub fn acquire(&self) {
        let mut permits = self.permits();
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    /// Take a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Wait at most `timeout` for a permit. Returns whether one was taken.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits();
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            permits = self
                .available
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *permits -= 1;
        true
    }

    /// Overwrite the permit count. Only meaningful while nothing waits.
    pub fn reset(&self, permits: usize) {
        *self.permits() = permits;
    }

    pub fn permits_available(&self) -> usize {
        *self.permits()
    }

    fn permits(&self) -> MutexGuard<'_, usize> {
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
