//! The capture daemon
//!
//! Three execution contexts share [`DaemonState`]: the scheduler thread, the
//! action dispatcher thread, and whichever driver thread calls back into
//! [`HalObserver`]. Client threads only touch the queues, the pending count
//! and the request source.

pub mod completion;
pub mod dispatcher;
pub mod drop_policy;
pub mod queue;
pub mod rt;
pub mod scheduler;
pub mod semaphore;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use arc_swap::ArcSwap;
use tracing::{debug, info, instrument, warn};

use crate::capture::frame::Frame;
use crate::capture::shot::{Shot, ShotIds};
use crate::device::Device;
use crate::error::Result;
use crate::events::{EventKind, EventSink};
use crate::hal::{CameraHal, HalObserver, HardwareFrame, SensorConfig};
use crate::Config;

use self::completion::FrameCompletionHandler;
use self::dispatcher::ActionDispatcher;
use self::drop_policy::DropSettings;
use self::queue::TsQueue;
use self::scheduler::CaptureScheduler;
use self::semaphore::Semaphore;

/// Wanted shots accepted but not yet handed to the client or evicted.
#[derive(Debug, Default)]
pub struct PendingShots(AtomicUsize);

impl PendingShots {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn add(&self, n: usize) {
        self.0.fetch_add(n, Ordering::AcqRel);
    }

    /// Saturates at zero.
    pub fn decrement(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// The repeating burst that refills the request queue while streaming.
#[derive(Default)]
pub(crate) struct RequestSource {
    burst: ArcSwap<Vec<Shot>>,
}

impl RequestSource {
    pub fn set(&self, burst: Vec<Shot>) {
        self.burst.store(Arc::new(burst));
    }

    pub fn clear(&self) {
        self.burst.store(Arc::new(Vec::new()));
    }

    pub fn is_active(&self) -> bool {
        !self.burst.load().is_empty()
    }
}

pub(crate) struct DaemonState {
    pub config: Config,
    pub sensor_config: SensorConfig,
    pub hal: Arc<dyn CameraHal>,
    pub ids: ShotIds,
    pub requests: TsQueue<Frame>,
    pub in_flight: TsQueue<Frame>,
    pub frames: TsQueue<Frame>,
    pub pending: PendingShots,
    pub drop_settings: Mutex<DropSettings>,
    pub events: EventSink,
    pub stop: AtomicBool,
    /// Posted by the driver once per vsync.
    pub ready: Semaphore,
    pub source: RequestSource,
    pub devices: ArcSwap<Vec<Arc<dyn Device>>>,
    pub dispatcher: ActionDispatcher,
}

impl DaemonState {
    pub fn drop_settings(&self) -> DropSettings {
        *self.lock_drop_settings()
    }

    pub fn lock_drop_settings(&self) -> MutexGuard<'_, DropSettings> {
        self.drop_settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a wanted or unwanted shot for capture.
    pub fn enqueue(&self, shot: Shot) {
        if shot.wanted {
            self.pending.increment();
        }
        self.requests.push(Frame::from_shot(shot));
    }

    /// Refill the request queue with one pass of the streaming burst. Each
    /// streamed shot is a fresh copy with its own id.
    pub fn generate_request(&self) {
        let burst = self.source.burst.load();
        for shot in burst.iter() {
            self.enqueue(shot.duplicate(&self.ids));
        }
    }

    /// Deliver a frame to the client queue and apply the drop policy.
    pub fn deliver(&self, frame: Frame) {
        metrics::counter!("sensord.frames_delivered").increment(1);
        self.frames.push(frame);
        drop_policy::enforce(&self.frames, self.drop_settings(), &self.pending, &self.events);
    }

    pub fn attach(&self, device: Arc<dyn Device>) {
        self.devices.rcu(|devices| {
            let mut devices = Vec::clone(devices);
            devices.push(device.clone());
            devices
        });
    }
}

/// Owns the pipeline threads and receives the driver's callbacks.
pub struct CaptureDaemon {
    state: Arc<DaemonState>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl CaptureDaemon {
    /// Build the daemon and register it as the HAL's observer. No threads
    /// run until [`CaptureDaemon::launch`].
    pub fn new(hal: Arc<dyn CameraHal>, config: Config, events: EventSink, ids: ShotIds) -> Arc<Self> {
        let drop_settings = DropSettings {
            policy: config.pipeline.drop_policy,
            limit: config.pipeline.frame_limit,
        };
        let state = Arc::new(DaemonState {
            sensor_config: hal.sensor_config(),
            dispatcher: ActionDispatcher::new(config.dispatcher.spin_window()),
            config,
            hal: hal.clone(),
            ids,
            requests: TsQueue::new(),
            in_flight: TsQueue::new(),
            frames: TsQueue::new(),
            pending: PendingShots::default(),
            drop_settings: Mutex::new(drop_settings),
            events,
            stop: AtomicBool::new(false),
            ready: Semaphore::new(0),
            source: RequestSource::default(),
            devices: ArcSwap::from_pointee(Vec::new()),
        });
        let daemon = Arc::new(Self {
            state,
            scheduler: Mutex::new(None),
            running: AtomicBool::new(false),
        });
        let observer: Arc<dyn HalObserver> = daemon.clone();
        hal.set_observer(Arc::downgrade(&observer));
        daemon
    }

    pub(crate) fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the dispatcher and scheduler threads. Does nothing if they are
    /// already running. A failure leaves the daemon stopped and is also
    /// reported as an `InternalError` event.
    #[instrument(skip(self))]
    pub fn launch(&self) -> Result<()> {
        let mut scheduler = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if scheduler.is_some() {
            return Ok(());
        }
        self.state.stop.store(false, Ordering::Release);
        // Wakeups posted by the last shutdown may have found nobody waiting.
        self.state.ready.reset(0);
        self.state.requests.resync();
        self.state.in_flight.resync();
        self.state.frames.resync();

        let config = &self.state.config;
        if let Err(e) = self
            .state
            .dispatcher
            .start(config.dispatcher.priority, config.dispatcher.cpu_core)
        {
            self.state.events.error(EventKind::InternalError, e.to_string());
            return Err(e);
        }

        let mut worker = CaptureScheduler::new(self.state.clone());
        match rt::spawn(
            "capture-sched",
            config.scheduler.priority,
            config.scheduler.cpu_core,
            move || worker.run(),
        ) {
            Ok(handle) => *scheduler = Some(handle),
            Err(e) => {
                self.state.events.error(EventKind::InternalError, e.to_string());
                self.state.dispatcher.shutdown();
                return Err(e);
            }
        }
        self.running.store(true, Ordering::Release);
        info!("capture daemon launched");
        Ok(())
    }

    /// A scheduler driven by hand with [`CaptureScheduler::tick`] instead of
    /// by the driver's ready signal.
    pub fn manual_scheduler(&self) -> CaptureScheduler {
        CaptureScheduler::new(self.state.clone())
    }

    /// Stop every thread and release whatever is still queued.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        self.state.stop.store(true, Ordering::Release);
        self.state.ready.post();
        self.state.requests.wake();
        self.state.in_flight.wake();
        self.state.frames.wake();

        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }
        let actions = self.state.dispatcher.shutdown();

        let requests = self.state.requests.drain().len();
        let in_flight = self.state.in_flight.drain().len();
        let frames = self.state.frames.drain().len();
        self.running.store(false, Ordering::Release);
        debug!(actions, requests, in_flight, frames, "capture daemon stopped");
    }
}

impl HalObserver for CaptureDaemon {
    fn on_frame(&self, frame: HardwareFrame) {
        FrameCompletionHandler::new(&self.state).handle(frame);
    }

    fn ready_to_capture(&self) {
        if self.running() {
            self.state.ready.post();
        }
    }
}

impl Drop for CaptureDaemon {
    fn drop(&mut self) {
        if self.running() {
            self.shutdown();
        }
    }
}
