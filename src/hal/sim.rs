//! Simulated vsync-driven sensor
//!
//! Stands in for a vendor HAL in the demo binary and the end-to-end tests.
//! A vsync thread ticks at a fixed interval; each tick completes the
//! captures that have spent `pipeline_depth` ticks in the sensor, in trigger
//! order, then tells the observer it may trigger again. Exposure and gain
//! writes take effect after the configured latencies, like real sensors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use super::{CameraHal, CaptureMode, FlashConfig, HalObserver, HardwareFrame, LensConfig, SensorConfig};
use crate::capture::image::{Image, PixelFormat, Size};

#[derive(Debug, Clone)]
pub struct SimulatedHalConfig {
    pub frame_interval: Duration,
    /// Vsync ticks between a trigger and its completion.
    pub pipeline_depth: u64,
    pub sensor: SensorConfig,
}

impl Default for SimulatedHalConfig {
    fn default() -> Self {
        let mode = |width, height, format| CaptureMode {
            size: Size::new(width, height),
            format,
            min_frame_time: Duration::from_micros(33_333),
            max_frame_time: Duration::from_secs(1),
            min_exposure: Duration::from_millis(1),
            max_exposure: Duration::from_millis(900),
        };
        Self {
            frame_interval: Duration::from_micros(33_333),
            pipeline_depth: 2,
            sensor: SensorConfig {
                modes: vec![
                    mode(640, 480, PixelFormat::Yuv420p),
                    mode(1280, 720, PixelFormat::Yuv420p),
                    mode(2592, 1944, PixelFormat::Raw),
                ],
                min_gain: 1.0,
                max_gain: 16.0,
                exposure_latency: 2,
                gain_latency: 1,
                lens: LensConfig::default(),
                flash: FlashConfig::default(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Capture {
    due_tick: u64,
    sequence: u64,
    size: Size,
    format: PixelFormat,
    exposure: Duration,
    gain: f32,
    white_balance: u32,
}

/// A register write that lands some ticks after it was made.
type Pending<T> = VecDeque<(u64, T)>;

struct SensorState {
    tick: u64,
    size: Size,
    format: PixelFormat,
    exposure: Duration,
    gain: f32,
    white_balance: u32,
    pending_exposure: Pending<Duration>,
    pending_gain: Pending<f32>,
    in_flight: VecDeque<Capture>,
}

impl SensorState {
    fn settle(&mut self) {
        let tick = self.tick;
        while let Some(&(at, value)) = self.pending_exposure.front() {
            if at > tick {
                break;
            }
            self.exposure = value;
            self.pending_exposure.pop_front();
        }
        while let Some(&(at, value)) = self.pending_gain.front() {
            if at > tick {
                break;
            }
            self.gain = value;
            self.pending_gain.pop_front();
        }
    }
}

struct Shared {
    config: SimulatedHalConfig,
    open: AtomicBool,
    observer: Mutex<Option<Weak<dyn HalObserver>>>,
    state: Mutex<SensorState>,
    /// Serializes deliveries from the vsync thread and mode-switch flushes.
    delivery: Mutex<()>,
    focuser: AtomicI32,
    sequence: AtomicU64,
    captures: AtomicU64,
    mode_switches: AtomicU64,
    fail_next_capture: AtomicBool,
    fail_next_mode_switch: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn observer(&self) -> Option<Arc<dyn HalObserver>> {
        lock(&self.observer).as_ref().and_then(Weak::upgrade)
    }

    fn vsync_loop(self: Arc<Self>) {
        let interval = self.config.frame_interval;
        let mut next = Instant::now() + interval;
        while self.open.load(Ordering::Acquire) {
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
            next += interval;

            {
                let _delivery = lock(&self.delivery);
                let due = {
                    let mut state = lock(&self.state);
                    state.tick += 1;
                    state.settle();
                    let tick = state.tick;
                    let mut due = Vec::new();
                    while state.in_flight.front().is_some_and(|c| c.due_tick <= tick) {
                        due.extend(state.in_flight.pop_front());
                    }
                    due
                };
                self.deliver(due);
            }

            if let Some(observer) = self.observer() {
                observer.ready_to_capture();
            }
        }
        debug!("simulated vsync stopped");
    }

    fn deliver(&self, captures: Vec<Capture>) {
        if captures.is_empty() {
            return;
        }
        let Some(observer) = self.observer() else {
            return;
        };
        for capture in captures {
            trace!(sequence = capture.sequence, "simulated frame complete");
            let image = Image::from_bytes(
                capture.size,
                capture.format,
                synthesize(capture.size, capture.format, capture.sequence),
                None,
            )
            .unwrap_or_else(|_| Image::placeholder(capture.size, capture.format));
            let now = Instant::now();
            observer.on_frame(HardwareFrame {
                image,
                exposure: capture.exposure,
                frame_time: capture.exposure.max(self.config.frame_interval),
                gain: capture.gain,
                white_balance: capture.white_balance,
                exposure_end: now,
                processing_done: now,
            });
        }
    }
}

/// Test pattern: a diagonal gradient that shifts with every frame.
fn synthesize(size: Size, format: PixelFormat, sequence: u64) -> Bytes {
    let w = size.width as usize;
    let h = size.height as usize;
    let phase = sequence as usize;
    match format {
        PixelFormat::Yuv420p => {
            let mut data = vec![128u8; w * (h + h / 2)];
            for (i, px) in data[..w * h].iter_mut().enumerate() {
                *px = ((i % w + i / w + phase) % 220 + 16) as u8;
            }
            data.into()
        }
        PixelFormat::Raw => (0..w * h)
            .flat_map(|i| (((i % w + i / w + phase) % 1024) as u16).to_le_bytes())
            .collect::<Vec<_>>()
            .into(),
        PixelFormat::Rgb24 => (0..w * h * 3)
            .map(|i| ((i / 3 + phase) % 256) as u8)
            .collect::<Vec<_>>()
            .into(),
        PixelFormat::Unknown => Bytes::new(),
    }
}

pub struct SimulatedHal {
    shared: Arc<Shared>,
    vsync: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedHal {
    pub fn new(config: SimulatedHalConfig) -> Self {
        let first = config.sensor.modes.first().copied();
        let lens = config.sensor.lens;
        Self {
            shared: Arc::new(Shared {
                open: AtomicBool::new(false),
                observer: Mutex::new(None),
                state: Mutex::new(SensorState {
                    tick: 0,
                    size: first.map_or(Size::default(), |m| m.size),
                    format: first.map_or(PixelFormat::Unknown, |m| m.format),
                    exposure: Duration::from_millis(10),
                    gain: 1.0,
                    white_balance: 5000,
                    pending_exposure: VecDeque::new(),
                    pending_gain: VecDeque::new(),
                    in_flight: VecDeque::new(),
                }),
                delivery: Mutex::new(()),
                focuser: AtomicI32::new(lens.min_position),
                sequence: AtomicU64::new(0),
                captures: AtomicU64::new(0),
                mode_switches: AtomicU64::new(0),
                fail_next_capture: AtomicBool::new(false),
                fail_next_mode_switch: AtomicBool::new(false),
                config,
            }),
            vsync: Mutex::new(None),
        }
    }

    /// Make the next `capture()` call fail.
    pub fn fail_next_capture(&self) {
        self.shared.fail_next_capture.store(true, Ordering::Release);
    }

    /// Make the next `set_capture_mode()` call fail.
    pub fn fail_next_mode_switch(&self) {
        self.shared.fail_next_mode_switch.store(true, Ordering::Release);
    }

    pub fn captures(&self) -> u64 {
        self.shared.captures.load(Ordering::Relaxed)
    }

    pub fn mode_switches(&self) -> u64 {
        self.shared.mode_switches.load(Ordering::Relaxed)
    }
}

impl Default for SimulatedHal {
    fn default() -> Self {
        Self::new(SimulatedHalConfig::default())
    }
}

impl CameraHal for SimulatedHal {
    fn open(&self) -> bool {
        let mut vsync = lock(&self.vsync);
        if vsync.is_some() {
            return true;
        }
        self.shared.open.store(true, Ordering::Release);
        let shared = self.shared.clone();
        match thread::Builder::new()
            .name("sim-vsync".into())
            .spawn(move || shared.vsync_loop())
        {
            Ok(handle) => {
                info!(
                    interval_us = self.shared.config.frame_interval.as_micros() as u64,
                    "simulated sensor opened"
                );
                *vsync = Some(handle);
                true
            }
            Err(e) => {
                error!("failed to start simulated vsync: {e}");
                self.shared.open.store(false, Ordering::Release);
                false
            }
        }
    }

    fn close(&self) {
        self.shared.open.store(false, Ordering::Release);
        if let Some(handle) = lock(&self.vsync).take() {
            if handle.join().is_err() {
                warn!("simulated vsync thread panicked");
            }
        }
        lock(&self.shared.state).in_flight.clear();
    }

    fn set_observer(&self, observer: Weak<dyn HalObserver>) {
        *lock(&self.shared.observer) = Some(observer);
    }

    fn sensor_config(&self) -> SensorConfig {
        self.shared.config.sensor.clone()
    }

    fn set_capture_mode(&self, mode: &CaptureMode) -> bool {
        let _delivery = lock(&self.shared.delivery);
        // Drain the pipeline first, completing everything already triggered.
        let flushed: Vec<_> = lock(&self.shared.state).in_flight.drain(..).collect();
        self.shared.deliver(flushed);

        if self.shared.fail_next_mode_switch.swap(false, Ordering::AcqRel) {
            return false;
        }
        let supported = mode.format != PixelFormat::Unknown
            && self.shared.config.sensor.modes.iter().any(|m| {
                m.size.width >= mode.size.width && m.size.height >= mode.size.height
            });
        if !supported {
            return false;
        }

        let mut state = lock(&self.shared.state);
        state.size = mode.size;
        state.format = mode.format;
        self.shared.mode_switches.fetch_add(1, Ordering::Relaxed);
        debug!(size = ?mode.size, format = ?mode.format, "simulated mode switch");
        true
    }

    fn set_sensor_exposure(&self, exposure: Duration) -> bool {
        let mut state = lock(&self.shared.state);
        let at = state.tick + u64::from(self.shared.config.sensor.exposure_latency);
        state.pending_exposure.push_back((at, exposure));
        true
    }

    fn set_sensor_effective_iso(&self, iso: u32) -> bool {
        let mut state = lock(&self.shared.state);
        let at = state.tick + u64::from(self.shared.config.sensor.gain_latency);
        state.pending_gain.push_back((at, iso as f32 / 100.0));
        true
    }

    fn set_isp_white_balance(&self, kelvin: u32) -> bool {
        lock(&self.shared.state).white_balance = kelvin;
        true
    }

    fn capture(&self) -> bool {
        if !self.shared.open.load(Ordering::Acquire)
            || self.shared.fail_next_capture.swap(false, Ordering::AcqRel)
        {
            return false;
        }
        let mut state = lock(&self.shared.state);
        state.settle();
        let capture = Capture {
            due_tick: state.tick + self.shared.config.pipeline_depth.max(1),
            sequence: self.shared.sequence.fetch_add(1, Ordering::Relaxed),
            size: state.size,
            format: state.format,
            exposure: state.exposure,
            gain: state.gain,
            white_balance: state.white_balance,
        };
        state.in_flight.push_back(capture);
        self.shared.captures.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn focuser_position(&self) -> Option<i32> {
        Some(self.shared.focuser.load(Ordering::Relaxed))
    }

    fn set_focuser_position(&self, ticks: i32) -> bool {
        self.shared.focuser.store(ticks, Ordering::Relaxed);
        true
    }

    fn set_flash_for_still_capture(&self, brightness: f32, _duration: Duration) -> f32 {
        let flash = &self.shared.config.sensor.flash;
        brightness.clamp(flash.min_brightness, flash.max_brightness)
    }

    fn set_flash_torch_mode(&self, brightness: f32) -> f32 {
        let flash = &self.shared.config.sensor.flash;
        brightness.clamp(flash.min_brightness, flash.max_brightness)
    }
}

impl Drop for SimulatedHal {
    fn drop(&mut self) {
        self.close();
    }
}
