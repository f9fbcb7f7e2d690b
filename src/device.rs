//! Flash and lens devices driven through the HAL
//!
//! Both keep a short history of what they were told to do so that a
//! delivered frame can be tagged with the device state during its exposure.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::{debug, warn};

use crate::capture::frame::Frame;
use crate::events::{Event, EventKind};
use crate::hal::{CameraHal, FlashConfig, LensConfig};

const HISTORY_LEN: usize = 512;

/// Something attached to a sensor that wants to annotate its frames.
pub trait Device: Send + Sync {
    /// Stable while the device is alive. Used as the owner tag of actions.
    fn id(&self) -> u64;

    fn tag_frame(&self, frame: &mut Frame);

    fn handle_event(&self, _event: &Event) {}
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    time: Instant,
    value: f32,
}

/// Time-stamped device state, newest last.
struct History {
    samples: Mutex<HeapRb<Sample>>,
}

impl History {
    fn new() -> Self {
        Self {
            samples: Mutex::new(HeapRb::new(HISTORY_LEN)),
        }
    }

    fn push(&self, time: Instant, value: f32) {
        self.samples().push_overwrite(Sample { time, value });
    }

    /// Newest first.
    fn snapshot(&self) -> Vec<Sample> {
        let samples = self.samples();
        let mut out: Vec<Sample> = samples.iter().copied().collect();
        out.reverse();
        out
    }

    fn is_empty(&self) -> bool {
        self.samples().is_empty()
    }

    fn samples(&self) -> MutexGuard<'_, HeapRb<Sample>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn micros(d: Duration) -> i64 {
    d.as_micros() as i64
}

pub struct Flash {
    hal: Arc<dyn CameraHal>,
    config: FlashConfig,
    history: History,
}

impl Flash {
    pub fn new(hal: Arc<dyn CameraHal>) -> Arc<Self> {
        let config = hal.sensor_config().flash;
        Arc::new(Self {
            hal,
            config,
            history: History::new(),
        })
    }

    pub fn fire_latency(&self) -> Duration {
        self.config.fire_latency
    }

    pub fn min_brightness(&self) -> f32 {
        self.config.min_brightness
    }

    pub fn max_brightness(&self) -> f32 {
        self.config.max_brightness
    }

    /// Fire for `duration`. `fire(0.0, ZERO)` turns the flash off.
    pub fn fire(&self, brightness: f32, duration: Duration) {
        let at = Instant::now() + self.fire_latency();
        let duration = duration.clamp(self.config.min_duration, self.config.max_duration);
        let brightness = self
            .hal
            .set_flash_for_still_capture(self.clamp(brightness), duration);
        debug!(brightness, duration_us = micros(duration), "flash fire");
        self.history.push(at, brightness);
    }

    pub fn torch(&self, brightness: f32) {
        let at = Instant::now() + self.fire_latency();
        let brightness = self.hal.set_flash_torch_mode(self.clamp(brightness));
        self.history.push(at, brightness);
    }

    /// Brightness in effect at `t`, `None` once the history no longer reaches back that far.
    pub fn brightness_at(&self, t: Instant) -> Option<f32> {
        self.history
            .snapshot()
            .into_iter()
            .find(|s| t > s.time)
            .map(|s| s.value)
    }

    fn clamp(&self, brightness: f32) -> f32 {
        brightness.clamp(self.config.min_brightness, self.config.max_brightness)
    }
}

impl Device for Flash {
    fn id(&self) -> u64 {
        self as *const Self as usize as u64
    }

    fn tag_frame(&self, frame: &mut Frame) {
        let (Some(t1), Some(t2)) = (frame.exposure_start, frame.exposure_end) else {
            return;
        };
        let history = self.history.snapshot();
        let state_at = |t: Instant| history.iter().find(|s| t > s.time).map_or(0.0, |s| s.value);
        let initial = state_at(t1);
        let last = state_at(t2);

        // Last turn-off and first turn-on inside the exposure.
        let mut off: Option<i64> = None;
        let mut on: Option<(i64, f32)> = None;
        for sample in history.iter().take_while(|s| s.time >= t1) {
            if sample.time > t2 {
                continue;
            }
            let offset = micros(sample.time - t1);
            if sample.value == 0.0 && off.is_none() {
                off = Some(offset);
            }
            if sample.value > 0.0 {
                on = Some((offset, sample.value));
            }
        }

        let exposure = micros(t2.saturating_duration_since(t1));
        let (brightness, duration, start) = if initial > 0.0 {
            if last == 0.0 {
                (initial, off.unwrap_or(exposure), 0)
            } else {
                ((initial + last) / 2.0, exposure, 0)
            }
        } else if last > 0.0 {
            let start = on.map_or(0, |(t, _)| t);
            (last, exposure - start, start)
        } else if let (Some((start, b)), Some(end)) = (on, off) {
            // Pulsed somewhere in the middle.
            (b, (end - start).max(0), start)
        } else {
            (0.0, 0, 0)
        };
        frame.tag("flash.brightness", brightness);
        frame.tag("flash.duration", duration);
        frame.tag("flash.start", start);
        frame.tag("flash.peak", start + duration / 2);
    }
}

pub struct Lens {
    hal: Arc<dyn CameraHal>,
    config: LensConfig,
    history: History,
}

impl Lens {
    /// Attach to the HAL's focuser and park at infinity.
    pub fn new(hal: Arc<dyn CameraHal>) -> Arc<Self> {
        let config = hal.sensor_config().lens;
        let lens = Arc::new(Self {
            hal,
            config,
            history: History::new(),
        });
        lens.set_focus(config.far_focus, None);
        lens
    }

    pub fn far_focus(&self) -> f32 {
        self.config.far_focus
    }

    pub fn near_focus(&self) -> f32 {
        self.config.near_focus
    }

    pub fn focus_latency(&self) -> Duration {
        self.config.focus_latency
    }

    pub fn zoom_latency(&self) -> Duration {
        self.config.zoom_latency
    }

    pub fn aperture_latency(&self) -> Duration {
        self.config.aperture_latency
    }

    /// Fixed focal length.
    pub fn zoom(&self) -> f32 {
        self.config.focal_length
    }

    /// Fixed aperture.
    pub fn aperture(&self) -> f32 {
        self.config.wide_aperture
    }

    /// Zoom is fixed on this platform; the request is only logged.
    pub fn set_zoom(&self, focal_length: f32) {
        debug!(focal_length, "zoom request ignored, focal length is fixed");
    }

    /// Aperture is fixed on this platform; the request is only logged.
    pub fn set_aperture(&self, aperture: f32) {
        debug!(aperture, "aperture request ignored, aperture is fixed");
    }

    /// Move to `diopters`, clamped to the focus range. `speed` in diopters per
    /// second; `None` means as fast as the lens goes.
    pub fn set_focus(&self, diopters: f32, speed: Option<f32>) {
        let (min_speed, max_speed) = (
            self.config.min_focus_speed * self.config.diopters_per_tick,
            self.config.max_focus_speed * self.config.diopters_per_tick,
        );
        let speed = if min_speed == 0.0 && max_speed == 0.0 {
            0.0
        } else {
            speed.unwrap_or(max_speed).clamp(min_speed, max_speed)
        };
        let target = diopters.clamp(self.far_focus(), self.near_focus());
        let old = self
            .hal
            .focuser_position()
            .map_or(0.0, |ticks| self.ticks_to_diopters(ticks));

        if !self.hal.set_focuser_position(self.diopters_to_ticks(target)) {
            warn!(target, "focuser rejected position");
            return;
        }
        let travel = if speed > 0.0 {
            Duration::from_secs_f32((target - old).abs() / speed)
        } else {
            Duration::ZERO
        };
        let start = Instant::now() + self.config.focus_latency;
        self.history.push(start, old);
        self.history
            .push(start + travel + self.config.focus_settle_time, target);
    }

    pub fn focus(&self) -> f32 {
        self.focus_at(Instant::now())
    }

    /// Interpolated focus at `t`. NaN when the history does not reach back.
    pub fn focus_at(&self, t: Instant) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        let history = self.history.snapshot();
        if t > history[0].time {
            return history[0].value;
        }
        for pair in history.windows(2) {
            let (newer, older) = (pair[0], pair[1]);
            if t < older.time {
                continue;
            }
            let span = (newer.time - older.time).as_secs_f32();
            if span == 0.0 {
                return newer.value;
            }
            let alpha = (t - older.time).as_secs_f32() / span;
            return alpha * newer.value + (1.0 - alpha) * older.value;
        }
        warn!("lens position unknown, history too short");
        f32::NAN
    }

    pub fn focus_changing(&self) -> bool {
        self.history
            .snapshot()
            .first()
            .is_some_and(|s| s.time > Instant::now())
    }

    fn ticks_to_diopters(&self, ticks: i32) -> f32 {
        let d = self.config.diopters_per_tick * (ticks - self.config.min_position) as f32;
        d.clamp(self.far_focus(), self.near_focus())
    }

    fn diopters_to_ticks(&self, diopters: f32) -> i32 {
        (diopters / self.config.diopters_per_tick) as i32 + self.config.min_position
    }
}

impl Device for Lens {
    fn id(&self) -> u64 {
        self as *const Self as usize as u64
    }

    fn tag_frame(&self, frame: &mut Frame) {
        let (Some(start), Some(end)) = (frame.exposure_start, frame.exposure_end) else {
            return;
        };
        let initial = self.focus_at(start);
        let last = self.focus_at(end);
        let exposure = end.saturating_duration_since(start).as_secs_f32();

        frame.tag("lens.initialFocus", initial);
        frame.tag("lens.finalFocus", last);
        frame.tag("lens.focus", last);
        frame.tag(
            "lens.focusSpeed",
            if exposure > 0.0 { (last - initial) / exposure } else { 0.0 },
        );
        frame.tag("lens.zoom", self.zoom());
        frame.tag("lens.aperture", self.aperture());
    }

    /// A mode switch restarts the driver, which forgets the focuser state.
    fn handle_event(&self, event: &Event) {
        if event.kind == EventKind::ModeChange {
            self.set_focus(self.focus_at(event.time), None);
        }
    }
}
