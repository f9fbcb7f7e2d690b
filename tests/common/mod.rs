//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use sensord::hal::{
    CameraHal, CaptureMode, HalObserver, SensorConfig, SimulatedHal, SimulatedHalConfig,
};
use sensord::{Config, Sensor, Size};

#[derive(Debug, Clone, PartialEq)]
pub enum HalCall {
    Open,
    Close,
    Mode(Size),
    Exposure(Duration),
    Iso(u32),
    WhiteBalance(u32),
    Capture(bool),
}

/// A fast simulated sensor that records every call made into it.
pub struct RecordingHal {
    pub sim: SimulatedHal,
    calls: Mutex<Vec<HalCall>>,
}

impl RecordingHal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sim: SimulatedHal::new(SimulatedHalConfig {
                frame_interval: Duration::from_millis(2),
                pipeline_depth: 2,
                ..Default::default()
            }),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<HalCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mode_switches(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, HalCall::Mode(_)))
            .count()
    }

    fn record(&self, call: HalCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl CameraHal for RecordingHal {
    fn open(&self) -> bool {
        self.record(HalCall::Open);
        self.sim.open()
    }

    fn close(&self) {
        self.record(HalCall::Close);
        self.sim.close();
    }

    fn set_observer(&self, observer: Weak<dyn HalObserver>) {
        self.sim.set_observer(observer);
    }

    fn sensor_config(&self) -> SensorConfig {
        self.sim.sensor_config()
    }

    fn set_capture_mode(&self, mode: &CaptureMode) -> bool {
        let ok = self.sim.set_capture_mode(mode);
        if ok {
            self.record(HalCall::Mode(mode.size));
        }
        ok
    }

    fn set_sensor_exposure(&self, exposure: Duration) -> bool {
        self.record(HalCall::Exposure(exposure));
        self.sim.set_sensor_exposure(exposure)
    }

    fn set_sensor_effective_iso(&self, iso: u32) -> bool {
        self.record(HalCall::Iso(iso));
        self.sim.set_sensor_effective_iso(iso)
    }

    fn set_isp_white_balance(&self, kelvin: u32) -> bool {
        self.record(HalCall::WhiteBalance(kelvin));
        self.sim.set_isp_white_balance(kelvin)
    }

    fn capture(&self) -> bool {
        let ok = self.sim.capture();
        self.record(HalCall::Capture(ok));
        ok
    }

    fn focuser_position(&self) -> Option<i32> {
        self.sim.focuser_position()
    }

    fn set_focuser_position(&self, ticks: i32) -> bool {
        self.sim.set_focuser_position(ticks)
    }

    fn set_flash_for_still_capture(&self, brightness: f32, duration: Duration) -> f32 {
        self.sim.set_flash_for_still_capture(brightness, duration)
    }

    fn set_flash_torch_mode(&self, brightness: f32) -> f32 {
        self.sim.set_flash_torch_mode(brightness)
    }
}

pub fn sensor_with(config: Config) -> (Arc<RecordingHal>, Sensor) {
    let hal = RecordingHal::new();
    let sensor = Sensor::new(hal.clone(), config);
    (hal, sensor)
}

pub fn sensor() -> (Arc<RecordingHal>, Sensor) {
    sensor_with(Config::default())
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
