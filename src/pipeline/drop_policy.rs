//! Output queue backpressure

use serde::{Deserialize, Serialize};

use super::queue::TsQueue;
use super::PendingShots;
use crate::capture::frame::Frame;
use crate::events::{EventKind, EventSink};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropPolicy {
    /// Evict from the front, keeping the freshest frames.
    #[default]
    DropOldest,
    /// Evict from the back, keeping the frames the client has waited longest for.
    DropNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropSettings {
    pub policy: DropPolicy,
    pub limit: usize,
}

impl Default for DropSettings {
    fn default() -> Self {
        Self {
            policy: DropPolicy::DropOldest,
            limit: 128,
        }
    }
}

/// Trim `frames` down to `settings.limit`, emitting one warning for the whole
/// call. Never blocks. Returns the number of frames evicted.
pub fn enforce(
    frames: &TsQueue<Frame>,
    settings: DropSettings,
    pending: &PendingShots,
    events: &EventSink,
) -> usize {
    let mut dropped = 0;
    while frames.len() > settings.limit {
        let evicted = match settings.policy {
            DropPolicy::DropOldest => frames.try_pull(),
            DropPolicy::DropNewest => frames.try_pull_back(),
        };
        // A consumer may have emptied the queue under us.
        if evicted.is_none() {
            break;
        }
        pending.decrement();
        dropped += 1;
    }

    if dropped > 0 {
        metrics::counter!("sensord.frames_dropped").increment(dropped as u64);
        events.warning(
            EventKind::FrameLimitHit,
            format!(
                "dropped {dropped} frame(s) under {:?}, frame limit is {}",
                settings.policy, settings.limit
            ),
        );
    }
    metrics::gauge!("sensord.output_queue_depth").set(frames.len() as f64);
    dropped
}
