//! Asynchronous event channel
//!
//! Everything that goes wrong on a real-time thread ends up here: it is logged
//! through `tracing` and posted to a bounded channel the client may drain.
//! Posting never blocks; when the channel is full the event is only logged.

use std::fmt;
use std::time::Instant;

use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A hardware call (capture trigger or mode switch) failed.
    DriverError,
    /// The drop policy evicted frames from the output queue.
    FrameLimitHit,
    /// A fixed image target stayed locked past the wait bound.
    ImageTargetLocked,
    ResolutionMismatch,
    FormatMismatch,
    /// The hardware did not return the expected image data.
    ImageDroppedError,
    /// Incorrect use of `Image::lock` / `Image::unlock`.
    ImageLockError,
    /// Frames were requested before the sensor was started.
    SensorStopped,
    /// Setup or resource failure, e.g. a worker thread could not be created.
    InternalError,
    /// The hardware switched capture mode; devices may have been reset.
    ModeChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub severity: Severity,
    pub time: Instant,
    pub description: String,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {:?}: {}", self.severity, self.kind, self.description)
    }
}

/// Producer side of the event channel. Cheap to clone.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<Event>,
}

impl EventSink {
    /// Create a sink and the receiver clients read from.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Event>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn error(&self, kind: EventKind, description: impl Into<String>) -> Event {
        let description = description.into();
        error!(?kind, "{description}");
        self.post(kind, Severity::Error, description)
    }

    pub fn warning(&self, kind: EventKind, description: impl Into<String>) -> Event {
        let description = description.into();
        warn!(?kind, "{description}");
        self.post(kind, Severity::Warning, description)
    }

    pub fn info(&self, kind: EventKind, description: impl Into<String>) -> Event {
        let description = description.into();
        info!(?kind, "{description}");
        self.post(kind, Severity::Info, description)
    }

    /// Returns the posted event so callers can forward it, e.g. to devices.
    fn post(&self, kind: EventKind, severity: Severity, description: String) -> Event {
        let event = Event {
            kind,
            severity,
            time: Instant::now(),
            description,
        };
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                metrics::counter!("sensord.events_overflowed").increment(1);
                debug!("event channel full, dropping {event}");
            }
            // Nobody is listening any more; the tracing record is enough.
            Err(TrySendError::Disconnected(_)) => {}
        }
        event
    }
}
