//! Deadline-ordered action dispatch
//!
//! A min-heap of actions keyed by absolute deadline, served by one thread at
//! the highest real-time priority. The thread waits on a semaphore, takes the
//! earliest action, sleeps until shortly before its deadline and spins the
//! rest of the way. The spin is what gets sub-millisecond accuracy out of a
//! general-purpose scheduler; its width is configurable.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use tracing::{debug, trace, warn};

use super::rt::{self, ThreadPriority};
use super::semaphore::Semaphore;
use crate::capture::action::Action;
use crate::error::Result;

struct Scheduled {
    deadline: Instant,
    /// Insertion order, breaks deadline ties.
    seq: u64,
    action: Action,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct Stats {
    fired: AtomicU64,
    max_lateness_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub fired: u64,
    pub max_lateness: Duration,
}

struct Inner {
    heap: Mutex<BinaryHeap<Reverse<Scheduled>>>,
    /// One permit per queued action, plus spurious posts on shutdown.
    signal: Semaphore,
    /// Notified on every push so a coarse sleep can retarget.
    arrived: Condvar,
    stop: AtomicBool,
    seq: AtomicU64,
    spin_window: Duration,
    stats: CachePadded<Stats>,
}

impl Inner {
    fn heap(&self) -> MutexGuard<'_, BinaryHeap<Reverse<Scheduled>>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        debug!(spin_window_us = self.spin_window.as_micros() as u64, "action dispatcher running");
        loop {
            self.signal.acquire();
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let Some(next) = self.next_due() else {
                continue;
            };
            while Instant::now() < next.deadline {
                std::hint::spin_loop();
            }

            next.action.execute();
            self.record(next.deadline);
        }
        debug!("action dispatcher stopped");
    }

    /// Sleep until the earliest action is within the spin window, then take
    /// it. An earlier arrival during the sleep becomes the new target.
    fn next_due(&self) -> Option<Scheduled> {
        let mut heap = self.heap();
        loop {
            if self.stop.load(Ordering::Acquire) {
                return None;
            }
            let deadline = heap.peek()?.0.deadline;
            let now = Instant::now();
            if deadline <= now + self.spin_window {
                return heap.pop().map(|Reverse(next)| next);
            }
            heap = self
                .arrived
                .wait_timeout(heap, deadline - now - self.spin_window)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn record(&self, deadline: Instant) {
        let lateness = Instant::now().saturating_duration_since(deadline);
        let lateness_us = lateness.as_micros() as u64;
        self.stats.fired.fetch_add(1, Ordering::Relaxed);
        self.stats.max_lateness_us.fetch_max(lateness_us, Ordering::Relaxed);
        metrics::histogram!("sensord.action_lateness_us").record(lateness_us as f64);
        trace!(lateness_us, "action fired");
    }
}

pub struct ActionDispatcher {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ActionDispatcher {
    pub fn new(spin_window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                heap: Mutex::new(BinaryHeap::new()),
                signal: Semaphore::new(0),
                arrived: Condvar::new(),
                stop: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                spin_window,
                stats: CachePadded::new(Stats::default()),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Queue `action` to fire at `deadline`. Deadlines already in the past
    /// fire as soon as the thread gets to them.
    pub fn schedule(&self, deadline: Instant, action: Action) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        self.inner.heap().push(Reverse(Scheduled {
            deadline,
            seq,
            action,
        }));
        self.inner.arrived.notify_one();
        self.inner.signal.post();
    }

    pub fn start(&self, priority: ThreadPriority, cpu_core: Option<usize>) -> Result<()> {
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if thread.is_some() {
            return Ok(());
        }
        self.inner.stop.store(false, Ordering::Release);
        let inner = self.inner.clone();
        *thread = Some(rt::spawn("action-dispatch", priority, cpu_core, move || inner.run())?);
        Ok(())
    }

    /// Stop the thread and drop everything still queued. Returns how many
    /// actions never fired.
    pub fn shutdown(&self) -> usize {
        self.inner.stop.store(true, Ordering::Release);
        {
            let _heap = self.inner.heap();
            self.inner.arrived.notify_all();
        }
        self.inner.signal.post();
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("action dispatcher thread panicked");
            }
        }
        self.cancel_all()
    }

    /// Remove every queued action without running it.
    pub fn cancel_all(&self) -> usize {
        let mut heap = self.inner.heap();
        let dropped = heap.len();
        heap.clear();
        while self.inner.signal.try_acquire() {}
        dropped
    }

    pub fn pending(&self) -> usize {
        self.inner.heap().len()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            fired: self.inner.stats.fired.load(Ordering::Relaxed),
            max_lateness: Duration::from_micros(
                self.inner.stats.max_lateness_us.load(Ordering::Relaxed),
            ),
        }
    }
}

impl Drop for ActionDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
