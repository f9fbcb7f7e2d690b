//! Per-vsync capture scheduling
//!
//! The scheduler owns its view of what the hardware is currently set up to
//! do. Every tick it takes one request, makes sure the mode and sensor
//! parameters the request expects will be in effect when its exposure
//! starts, queues the request's device actions, and triggers one capture.
//! Parameter changes are absorbed by unwanted "bubble" frames so a wanted
//! frame never reports settings it was not captured with.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, trace, warn};

use super::DaemonState;
use crate::capture::action::Action;
use crate::capture::frame::{Confidence, Frame};
use crate::capture::image::{Image, PixelFormat, Size};
use crate::capture::shot::{HistogramConfig, ImageTarget, SharpnessConfig, Shot};
use crate::events::EventKind;

/// Gain differences below this are not worth a sensor write.
const GAIN_EPSILON: f32 = 0.01;

/// What the scheduler believes the hardware is doing. `None` means unknown,
/// which is the case at startup and right after a mode switch.
#[derive(Debug, Default)]
struct Current {
    target: Option<(Size, PixelFormat)>,
    image: Option<Image>,
    exposure: Option<Duration>,
    gain: Option<f32>,
    white_balance: Option<u32>,
    frame_time: Option<Duration>,
    histogram: HistogramConfig,
    sharpness: SharpnessConfig,
    /// Actions of the last triggered request, retired on the next tick.
    actions: Vec<Action>,
}

impl Current {
    fn exposure_differs(&self, exposure: Duration) -> bool {
        self.exposure != Some(exposure)
    }

    fn gain_differs(&self, gain: f32) -> bool {
        self.gain.map_or(true, |g| (g - gain).abs() > GAIN_EPSILON)
    }

    fn white_balance_differs(&self, kelvin: u32) -> bool {
        self.white_balance != Some(kelvin)
    }

    fn params_differ(&self, shot: &Shot) -> bool {
        self.exposure_differs(shot.exposure)
            || self.gain_differs(shot.gain)
            || self.white_balance_differs(shot.white_balance)
    }
}

/// Result of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A capture was triggered for this request id.
    Triggered { id: u64, wanted: bool },
    /// Nothing to do because the daemon is stopping.
    Idle,
    /// The mode switch failed; the request was delivered without pixels.
    ModeSwitchFailed { id: u64 },
    /// The trigger failed; the request was delivered without pixels.
    CaptureFailed { id: u64 },
}

pub struct CaptureScheduler {
    state: Arc<DaemonState>,
    current: Current,
    exposure_latency: u32,
    gain_latency: u32,
}

impl CaptureScheduler {
    pub(crate) fn new(state: Arc<DaemonState>) -> Self {
        Self {
            state,
            current: Current::default(),
            exposure_latency: 0,
            gain_latency: 0,
        }
    }

    /// One tick per ready signal from the driver until the daemon stops.
    pub fn run(&mut self) {
        info!("capture scheduler running");
        loop {
            self.state.ready.acquire();
            if self.state.stop.load(Ordering::Acquire) {
                break;
            }
            self.tick(Instant::now());
        }
        self.retire_actions();
        info!("capture scheduler stopped");
    }

    /// Schedule and trigger one capture. `t0` is the timestamp of the ready
    /// signal; non-zero action offsets are measured from it.
    #[instrument(level = "trace", skip(self))]
    pub fn tick(&mut self, t0: Instant) -> Tick {
        self.retire_actions();

        if self.state.requests.is_empty() {
            self.state.generate_request();
        }
        if self.state.requests.is_empty() {
            if self.state.stop.load(Ordering::Acquire) {
                return Tick::Idle;
            }
            let bubble = self.bubble_from_current();
            self.state.requests.push_front(bubble);
        }

        let Some(head) = self.state.requests.with_front(|f| f.shot().clone()) else {
            return Tick::Idle;
        };

        let wanted_target = (head.image.size, head.image.format);
        if self.current.target != Some(wanted_target) {
            if let Err(id) = self.switch_mode(&head) {
                return Tick::ModeSwitchFailed { id };
            }
        }

        if self.current.params_differ(&head) {
            let bubble = self.bubble_like(&head);
            self.state.requests.push_front(bubble);
        }

        let Some(mut req) = self.state.requests.try_pull() else {
            return Tick::Idle;
        };
        if let Some(image) = &self.current.image {
            req.image = image.clone();
        }
        if self.state.requests.is_empty() {
            self.state.generate_request();
        }

        if let Some(exposure) = self.current.exposure {
            req.exposure = exposure;
        }
        if let Some(gain) = self.current.gain {
            req.gain = gain;
        }
        if let Some(kelvin) = self.current.white_balance {
            req.white_balance = kelvin;
        }

        self.look_ahead();

        // A frame can never be shorter than its own exposure.
        let frame_time = req.shot().frame_time.max(req.shot().exposure);
        self.current.frame_time = Some(frame_time);
        self.current.histogram = req.shot().histogram;
        self.current.sharpness = req.shot().sharpness;
        req.frame_time = frame_time;

        self.schedule_actions(&req, t0);

        let id = req.id();
        let wanted = req.wanted();
        if !self.state.hal.capture() {
            metrics::counter!("sensord.driver_errors").increment(1);
            self.state
                .events
                .error(EventKind::DriverError, format!("capture trigger failed for shot {id}"));
            if wanted {
                self.state.deliver(req);
            }
            return Tick::CaptureFailed { id };
        }

        trace!(id, wanted, "capture triggered");
        self.state.in_flight.push(req);
        Tick::Triggered { id, wanted }
    }

    /// Undo single-shot device state left by the previous capture.
    fn retire_actions(&mut self) {
        for action in self.current.actions.drain(..) {
            if action.retire() {
                trace!(payload = ?action.payload, "retired action");
            }
        }
    }

    fn switch_mode(&mut self, head: &Shot) -> Result<(), u64> {
        let size = head.image.size;
        let target = head.image.format;
        let hw_format = if target == PixelFormat::Raw {
            PixelFormat::Raw
        } else {
            PixelFormat::Yuv420p
        };

        let switched = self
            .state
            .sensor_config
            .mode_for(size, hw_format)
            .is_some_and(|mode| self.state.hal.set_capture_mode(&mode));
        if !switched {
            metrics::counter!("sensord.driver_errors").increment(1);
            self.state.events.error(
                EventKind::DriverError,
                format!("mode switch to {}x{} {hw_format:?} failed", size.width, size.height),
            );
            let id = head.id();
            if let Some(req) = self.state.requests.try_pull() {
                if req.wanted() {
                    self.state.deliver(req);
                }
            }
            return Err(id);
        }

        let event = self.state.events.info(
            EventKind::ModeChange,
            format!("capture mode is now {}x{} {hw_format:?}", size.width, size.height),
        );
        for device in self.state.devices.load().iter() {
            device.handle_event(&event);
        }
        debug!(size = ?size, format = ?hw_format, "capture mode switched");

        // A mode switch resets the sensor, so nothing we wrote earlier holds.
        self.current = Current {
            target: Some((size, target)),
            image: Some(Image::placeholder(size, hw_format)),
            histogram: head.histogram,
            sharpness: head.sharpness,
            actions: std::mem::take(&mut self.current.actions),
            ..Current::default()
        };
        Ok(())
    }

    /// Write the next request's sensor parameters now so they land in time,
    /// then either pad with bubbles or mark the request as uncertain.
    fn look_ahead(&mut self) {
        let Some(next) = self.state.requests.with_front(|f| f.shot().clone()) else {
            return;
        };
        let hal = &self.state.hal;
        let sensor = &self.state.sensor_config;

        let exposure_changed = self.current.exposure_differs(next.exposure);
        if exposure_changed {
            if !hal.set_sensor_exposure(next.exposure) {
                warn!(exposure = ?next.exposure, "sensor rejected exposure");
            }
            self.current.exposure = Some(next.exposure);
            self.exposure_latency = sensor.exposure_latency;
        }
        let gain_changed = self.current.gain_differs(next.gain);
        if gain_changed {
            let iso = (next.gain * 100.0).round() as u32;
            if !hal.set_sensor_effective_iso(iso) {
                warn!(iso, "sensor rejected gain");
            }
            self.current.gain = Some(next.gain);
            self.gain_latency = sensor.gain_latency;
        }
        if !exposure_changed && !gain_changed {
            self.exposure_latency = self.exposure_latency.saturating_sub(1);
            self.gain_latency = self.gain_latency.saturating_sub(1);
        }
        if self.current.white_balance_differs(next.white_balance) {
            if !hal.set_isp_white_balance(next.white_balance) {
                warn!(kelvin = next.white_balance, "ISP rejected white balance");
            }
            self.current.white_balance = Some(next.white_balance);
        }

        if next.fast_mode {
            let mut confidence = Confidence::MATCH_REQUEST;
            if self.exposure_latency > 0 {
                confidence |= Confidence::UNCERTAIN_EXPOSURE;
            }
            if self.gain_latency > 0 {
                confidence |= Confidence::UNCERTAIN_GAIN;
            }
            self.state.requests.with_front(|f| f.confidence = confidence);
            return;
        }

        self.state
            .requests
            .with_front(|f| f.confidence = Confidence::MATCH_REQUEST);
        let bubbles = self.exposure_latency.max(self.gain_latency);
        for _ in 0..bubbles {
            let bubble = self.bubble_like(&next);
            self.state.requests.push_front(bubble);
        }
        if bubbles > 0 {
            trace!(bubbles, "absorbing sensor latency");
        }
        self.exposure_latency = 0;
        self.gain_latency = 0;
    }

    fn schedule_actions(&mut self, req: &Frame, t0: Instant) {
        for action in req.shot().actions() {
            if action.time.is_zero() {
                action.execute();
            } else {
                let deadline = (t0 + action.time)
                    .checked_sub(action.latency)
                    .unwrap_or(t0);
                self.state.dispatcher.schedule(deadline, action.clone());
            }
            self.current.actions.push(action.clone());
        }
    }

    /// An unwanted copy of `shot` with its own id, no pixels and no actions.
    fn bubble_like(&self, shot: &Shot) -> Frame {
        let mut bubble = shot.duplicate(&self.state.ids);
        bubble.wanted = false;
        bubble.image = ImageTarget::discard(shot.image.size, shot.image.format);
        bubble.clear_all_actions();
        metrics::counter!("sensord.bubbles").increment(1);
        Frame::from_shot(bubble)
    }

    /// Filler for a tick with no requests, matching the current setup so it
    /// causes no mode switch or parameter write.
    fn bubble_from_current(&self) -> Frame {
        let mut shot = Shot::new(&self.state.ids);
        if let Some((size, format)) = self.current.target {
            shot.image = ImageTarget::discard(size, format);
        }
        if let Some(exposure) = self.current.exposure {
            shot.exposure = exposure;
        }
        if let Some(gain) = self.current.gain {
            shot.gain = gain;
        }
        if let Some(kelvin) = self.current.white_balance {
            shot.white_balance = kelvin;
        }
        if let Some(frame_time) = self.current.frame_time {
            shot.frame_time = frame_time;
        }
        shot.histogram = self.current.histogram;
        shot.sharpness = self.current.sharpness;
        shot.wanted = false;
        metrics::counter!("sensord.bubbles").increment(1);
        Frame::from_shot(shot)
    }
}
