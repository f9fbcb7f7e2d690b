//! Blocking double-ended queue shared between the pipeline threads
//!
//! One mutex guards the deque, one counting semaphore tracks how many
//! entries may be consumed. Pushes are safe from any number of producers.
//! `pop`, `front` and friends assume a single consumer; `pull` is the only
//! operation that is safe for several consumers at once.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::semaphore::Semaphore;

pub struct TsQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Semaphore,
}

impl<T> Default for TsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TsQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
        }
    }

    /// Append to the back. Never blocks.
    pub fn push(&self, value: T) {
        let mut items = self.items();
        items.push_back(value);
        self.available.post();
    }

    /// Insert ahead of everything already queued.
    pub fn push_front(&self, value: T) {
        let mut items = self.items();
        items.push_front(value);
        self.available.post();
    }

    /// Remove the front entry without waiting. Returns whether one was removed.
    pub fn pop(&self) -> bool {
        self.try_pull().is_some()
    }

    /// Remove the back entry without waiting. Returns whether one was removed.
    pub fn pop_back(&self) -> bool {
        self.try_pull_back().is_some()
    }

    /// Block until an entry is available, then remove and return it.
    ///
    /// Returns `None` only when the queue was woken by [`TsQueue::wake`]
    /// with nothing in it, which is how shutdown reaches blocked consumers.
    pub fn pull(&self) -> Option<T> {
        self.available.acquire();
        self.items().pop_front()
    }

    /// Like [`TsQueue::pull`] but takes the most recently pushed entry.
    pub fn pull_back(&self) -> Option<T> {
        self.available.acquire();
        self.items().pop_back()
    }

    pub fn try_pull(&self) -> Option<T> {
        if !self.available.try_acquire() {
            return None;
        }
        self.items().pop_front()
    }

    pub fn try_pull_back(&self) -> Option<T> {
        if !self.available.try_acquire() {
            return None;
        }
        self.items().pop_back()
    }

    /// Wait for the queue to become non-empty without consuming anything.
    /// `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let acquired = match timeout {
            None => {
                self.available.acquire();
                true
            }
            Some(timeout) => self.available.acquire_timeout(timeout),
        };
        if acquired {
            // Hand the permit back, we only peeked.
            self.available.post();
        }
        acquired
    }

    /// Wake one blocked consumer even though nothing was queued.
    ///
    /// The permit outlives the wakeup if nobody was blocked; call
    /// [`TsQueue::resync`] before the queue is used again.
    pub fn wake(&self) {
        self.available.post();
    }

    /// Drop permits left over from [`TsQueue::wake`] so the count matches
    /// the entries again. Must not race a blocked consumer.
    pub fn resync(&self) {
        let items = self.items();
        self.available.reset(items.len());
    }

    /// Run `f` on the front entry while the queue is locked.
    pub fn with_front<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.items().front_mut().map(f)
    }

    /// Run `f` on the back entry while the queue is locked.
    pub fn with_back<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.items().back_mut().map(f)
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Lock the queue for scanning and selective removal.
    pub fn lock(&self) -> LockedQueue<'_, T> {
        LockedQueue {
            items: self.items(),
            available: &self.available,
        }
    }

    /// Remove everything, returning the entries front to back.
    pub fn drain(&self) -> Vec<T> {
        let mut locked = self.lock();
        let mut drained = Vec::with_capacity(locked.len());
        while let Some(value) = locked.erase(0) {
            drained.push(value);
        }
        drained
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> TsQueue<T> {
    pub fn front(&self) -> Option<T> {
        self.items().front().cloned()
    }

    pub fn back(&self) -> Option<T> {
        self.items().back().cloned()
    }
}

/// Exclusive view of a [`TsQueue`]. The queue stays locked until this is dropped.
pub struct LockedQueue<'a, T> {
    items: MutexGuard<'a, VecDeque<T>>,
    available: &'a Semaphore,
}

impl<T> LockedQueue<'_, T> {
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove the entry at `index`.
    ///
    /// Fails if another thread already reserved the entries through the
    /// semaphore before this lock was taken.
    pub fn erase(&mut self, index: usize) -> Option<T> {
        if index >= self.items.len() || !self.available.try_acquire() {
            return None;
        }
        self.items.remove(index)
    }

    /// Remove the first entry matching `pred`.
    pub fn erase_first(&mut self, pred: impl FnMut(&T) -> bool) -> Option<T> {
        let index = self.items.iter().position(pred)?;
        self.erase(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn push_front_takes_priority() {
        let q = TsQueue::new();
        q.push(2);
        q.push(3);
        q.push_front(1);
        assert_eq!(q.front(), Some(1));
        assert_eq!(q.back(), Some(3));
        assert_eq!(q.pull(), Some(1));
        assert_eq!(q.try_pull_back(), Some(3));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn try_pull_on_empty_queue_fails() {
        let q: TsQueue<u8> = TsQueue::new();
        assert!(q.try_pull().is_none());
        assert!(q.try_pull_back().is_none());
        assert!(!q.pop());
        assert!(q.is_empty());
    }

    #[test]
    fn wait_does_not_consume() {
        let q = TsQueue::new();
        assert!(!q.wait(Some(Duration::from_millis(5))));
        q.push(7);
        assert!(q.wait(Some(Duration::from_millis(5))));
        assert!(q.wait(None));
        assert_eq!(q.try_pull(), Some(7));
    }

    #[test]
    fn wake_releases_blocked_consumer() {
        let q: Arc<TsQueue<u32>> = Arc::new(TsQueue::new());
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pull())
        };
        thread::sleep(Duration::from_millis(10));
        q.wake();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn resync_discards_unused_wakeups() {
        let q = TsQueue::new();
        q.wake();
        q.wake();
        q.push(1);
        q.resync();
        assert_eq!(q.try_pull(), Some(1));
        assert!(!q.wait(Some(Duration::from_millis(5))));

        q.wake();
        q.resync();
        q.push(2);
        assert_eq!(q.pull(), Some(2));
        assert!(q.try_pull().is_none());
    }

    #[test]
    fn pull_blocks_until_push() {
        let q = Arc::new(TsQueue::new());
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push("frame");
            })
        };
        let start = Instant::now();
        assert_eq!(q.pull(), Some("frame"));
        assert!(start.elapsed() >= Duration::from_millis(15));
        producer.join().unwrap();
    }

    #[test]
    fn locked_erase_keeps_count_consistent() {
        let q = TsQueue::new();
        for i in 0..5 {
            q.push(i);
        }
        {
            let mut locked = q.lock();
            assert_eq!(locked.erase_first(|v| *v == 3), Some(3));
            assert!(locked.erase(10).is_none());
            assert_eq!(locked.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2, 4]);
        }
        assert_eq!(q.drain(), vec![0, 1, 2, 4]);
        assert!(q.try_pull().is_none());
    }

    #[test]
    fn with_front_mutates_in_place() {
        let q = TsQueue::new();
        q.push(1);
        q.push(2);
        assert_eq!(q.with_front(|v| {
            *v += 10;
            *v
        }), Some(11));
        assert_eq!(q.with_back(|v| *v), Some(2));
        assert_eq!(q.pull(), Some(11));
    }

    #[test]
    fn concurrent_producers_then_consumers() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 500;

        let q = Arc::new(TsQueue::new());
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.push(p * PER_PRODUCER + i);
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }
        assert_eq!(q.len(), PRODUCERS * PER_PRODUCER);

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..(PRODUCERS * PER_PRODUCER / 4) {
                        seen.push(q.pull().unwrap());
                    }
                    seen
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in consumers {
            for value in handle.join().unwrap() {
                assert!(all.insert(value), "value {value} pulled twice");
            }
        }
        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
        assert!(q.is_empty());
    }
}
