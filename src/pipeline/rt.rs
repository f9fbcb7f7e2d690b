//! Real-time worker threads
//!
//! Native threads with an optional `SCHED_FIFO` priority and CPU pin. Timing
//! on a general-purpose kernel stays best-effort; without `CAP_SYS_NICE` the
//! priority request is refused and the thread runs at normal priority.

use std::io;
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadPriority {
    /// Keep whatever the spawning thread had.
    #[default]
    Inherit,
    RealtimeMin,
    RealtimeMax,
    /// Explicit `SCHED_FIFO` level, clamped to the valid range.
    Realtime(i32),
}

/// Spawn `f` on a named thread, applying `priority` and `cpu_core` from inside
/// the new thread before `f` runs.
pub fn spawn<F, T>(
    name: &'static str,
    priority: ThreadPriority,
    cpu_core: Option<usize>,
    f: F,
) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            apply_priority(name, priority);
            if let Some(core) = cpu_core {
                pin_to_core(name, core);
            }
            f()
        })
        .map_err(|source| Error::ThreadSpawn { name, source })
}

#[cfg(target_os = "linux")]
fn apply_priority(name: &str, priority: ThreadPriority) {
    // SAFETY: plain libc queries with a valid policy constant.
    let (min, max) = unsafe {
        (
            libc::sched_get_priority_min(libc::SCHED_FIFO),
            libc::sched_get_priority_max(libc::SCHED_FIFO),
        )
    };
    let level = match priority {
        ThreadPriority::Inherit => return,
        ThreadPriority::RealtimeMin => min,
        ThreadPriority::RealtimeMax => max,
        ThreadPriority::Realtime(level) => level.clamp(min, max),
    };

    let param = libc::sched_param {
        sched_priority: level,
    };
    // SAFETY: pthread_self() is always a valid handle for the calling thread.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc == 0 {
        info!(thread = name, level, "running with SCHED_FIFO scheduler policy");
    } else {
        warn!(
            thread = name,
            level,
            "failed to set SCHED_FIFO scheduler policy: {}",
            io::Error::from_raw_os_error(rc)
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(name: &str, priority: ThreadPriority) {
    if priority != ThreadPriority::Inherit {
        warn!(thread = name, ?priority, "real-time priority is only supported on Linux");
    }
}

fn pin_to_core(name: &str, core: usize) {
    let Some(id) = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|c| c.id == core)
    else {
        warn!(thread = name, core, "no such CPU core, not pinning");
        return;
    };
    if core_affinity::set_for_current(id) {
        debug!(thread = name, core, "pinned to CPU core");
    } else {
        warn!(thread = name, core, "failed to pin to CPU core");
    }
}
