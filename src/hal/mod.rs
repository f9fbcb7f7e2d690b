//! Hardware abstraction layer contract
//!
//! The vendor HAL is an external collaborator. The daemon only drives it
//! through [`CameraHal`] and hears back from it through [`HalObserver`],
//! which the driver calls from its own threads.

pub mod sim;

use std::sync::Weak;
use std::time::{Duration, Instant};

use crate::capture::image::{Image, PixelFormat, Size};

pub use sim::{SimulatedHal, SimulatedHalConfig};

/// One sensor readout configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureMode {
    pub size: Size,
    pub format: PixelFormat,
    pub min_frame_time: Duration,
    pub max_frame_time: Duration,
    pub min_exposure: Duration,
    pub max_exposure: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LensConfig {
    pub far_focus: f32,
    pub near_focus: f32,
    pub diopters_per_tick: f32,
    pub min_position: i32,
    pub min_focus_speed: f32,
    pub max_focus_speed: f32,
    pub focus_latency: Duration,
    pub focus_settle_time: Duration,
    pub focal_length: f32,
    pub zoom_latency: Duration,
    pub wide_aperture: f32,
    pub narrow_aperture: f32,
    pub aperture_latency: Duration,
}

impl Default for LensConfig {
    fn default() -> Self {
        Self {
            far_focus: 0.0,
            near_focus: 10.0,
            diopters_per_tick: 0.01,
            min_position: 0,
            min_focus_speed: 0.0,
            max_focus_speed: 0.0,
            focus_latency: Duration::ZERO,
            focus_settle_time: Duration::from_millis(15),
            focal_length: 4.0,
            zoom_latency: Duration::ZERO,
            wide_aperture: 2.4,
            narrow_aperture: 2.4,
            aperture_latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlashConfig {
    pub min_brightness: f32,
    pub max_brightness: f32,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub fire_latency: Duration,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            min_brightness: 0.0,
            max_brightness: 1.0,
            min_duration: Duration::ZERO,
            max_duration: Duration::from_millis(500),
            fire_latency: Duration::ZERO,
        }
    }
}

/// Read-only platform description reported by the HAL.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub modes: Vec<CaptureMode>,
    pub min_gain: f32,
    pub max_gain: f32,
    /// Frames between writing an exposure and seeing it in the output.
    pub exposure_latency: u32,
    pub gain_latency: u32,
    pub lens: LensConfig,
    pub flash: FlashConfig,
}

impl SensorConfig {
    /// Smallest mode that can hold `size`, or the largest mode if none can.
    pub fn best_mode(&self, size: Size) -> Option<&CaptureMode> {
        self.modes
            .iter()
            .filter(|m| m.size.width >= size.width && m.size.height >= size.height)
            .min_by_key(|m| m.size.area())
            .or_else(|| self.modes.iter().max_by_key(|m| m.size.area()))
    }

    /// Mode matching `size` exactly, as the scheduler requests it.
    pub fn mode_for(&self, size: Size, format: PixelFormat) -> Option<CaptureMode> {
        self.best_mode(size).map(|m| CaptureMode {
            size,
            format,
            ..*m
        })
    }
}

/// What the driver hands back for one completed capture.
#[derive(Debug, Clone)]
pub struct HardwareFrame {
    /// Usually a weak image aliasing the driver's buffer. A placeholder if
    /// the driver lost the data.
    pub image: Image,
    pub exposure: Duration,
    pub frame_time: Duration,
    pub gain: f32,
    pub white_balance: u32,
    pub exposure_end: Instant,
    pub processing_done: Instant,
}

/// Callbacks invoked by the driver on its own threads.
pub trait HalObserver: Send + Sync {
    /// One physical frame finished.
    fn on_frame(&self, frame: HardwareFrame);

    /// The sensor can accept the next trigger.
    fn ready_to_capture(&self);
}

/// Calls the daemon makes into the vendor HAL. Boolean results follow the
/// driver contract: `false` means the call failed and nothing changed.
pub trait CameraHal: Send + Sync {
    fn open(&self) -> bool;

    fn close(&self);

    /// The HAL must not keep the observer alive.
    fn set_observer(&self, observer: Weak<dyn HalObserver>);

    fn sensor_config(&self) -> SensorConfig;

    /// May block while the driver drains its own pipeline.
    fn set_capture_mode(&self, mode: &CaptureMode) -> bool;

    fn set_sensor_exposure(&self, exposure: Duration) -> bool;

    /// Gain expressed as ISO, `gain * 100`.
    fn set_sensor_effective_iso(&self, iso: u32) -> bool;

    fn set_isp_white_balance(&self, kelvin: u32) -> bool;

    fn capture(&self) -> bool;

    fn focuser_position(&self) -> Option<i32> {
        None
    }

    fn set_focuser_position(&self, _ticks: i32) -> bool {
        false
    }

    /// Returns the brightness actually programmed.
    fn set_flash_for_still_capture(&self, _brightness: f32, _duration: Duration) -> f32 {
        0.0
    }

    fn set_flash_torch_mode(&self, _brightness: f32) -> f32 {
        0.0
    }
}
