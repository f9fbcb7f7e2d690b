//! Client-facing sensor
//!
//! [`Sensor`] is what applications hold. Capture and stream calls only
//! enqueue and return; [`Sensor::get_frame`] blocks until the next frame is
//! delivered. Worker threads start with the first capture or stream call.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use flume::Receiver;
use tracing::{debug, info, instrument};

use crate::capture::frame::Frame;
use crate::capture::image::Size;
use crate::capture::shot::{Shot, ShotIds};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, EventSink};
use crate::hal::{CameraHal, CaptureMode, SensorConfig};
use crate::pipeline::dispatcher::DispatcherStats;
use crate::pipeline::drop_policy::{self, DropPolicy, DropSettings};
use crate::pipeline::CaptureDaemon;
use crate::Config;

/// The driver only supports exposure in whole milliseconds.
const MIN_EXPOSURE: Duration = Duration::from_millis(1);

pub struct Sensor {
    hal: Arc<dyn CameraHal>,
    config: Config,
    sensor_config: SensorConfig,
    ids: ShotIds,
    events: EventSink,
    event_rx: Receiver<Event>,
    daemon: Arc<CaptureDaemon>,
    /// Keeps a burst contiguous in the request queue.
    submit: Mutex<()>,
}

impl Sensor {
    pub fn new(hal: Arc<dyn CameraHal>, config: Config) -> Self {
        let (events, event_rx) = EventSink::bounded(config.events.capacity);
        let ids = ShotIds::new();
        let daemon = CaptureDaemon::new(hal.clone(), config.clone(), events.clone(), ids.clone());
        Self {
            sensor_config: hal.sensor_config(),
            hal,
            config,
            ids,
            events,
            event_rx,
            daemon,
            submit: Mutex::new(()),
        }
    }

    /// Open the HAL and launch the pipeline threads. Called implicitly by
    /// the capture and stream calls.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        if self.daemon.running() {
            return Ok(());
        }
        if !self.hal.open() {
            self.events
                .error(EventKind::InternalError, "camera HAL failed to open");
            return Err(Error::HalOpen);
        }
        self.daemon.launch()?;
        info!("sensor started");
        Ok(())
    }

    /// Stop streaming, cancel queued shots, give in-flight captures a
    /// bounded time to land, then shut everything down.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        if !self.daemon.running() {
            return;
        }
        let state = self.daemon.state();
        state.source.clear();

        let mut cancelled = 0;
        while let Some(frame) = state.requests.try_pull_back() {
            if frame.wanted() {
                state.pending.decrement();
                cancelled += 1;
            }
        }

        let deadline = Instant::now() + self.config.pipeline.shutdown_drain_timeout();
        // Idle bubbles keep the pipeline busy, so only wait for wanted frames.
        while state.in_flight.lock().iter().any(Frame::wanted) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        self.daemon.shutdown();
        self.hal.close();
        state.pending.reset();
        debug!(cancelled, "sensor stopped");
    }

    pub fn running(&self) -> bool {
        self.daemon.running()
    }

    /// Queue one shot. Returns as soon as it is queued.
    pub fn capture(&self, shot: &Shot) -> Result<()> {
        self.capture_burst(std::slice::from_ref(shot))
    }

    /// Queue a burst back to back, in order.
    pub fn capture_burst(&self, burst: &[Shot]) -> Result<()> {
        self.start()?;
        let _submit = self.submit.lock().unwrap_or_else(PoisonError::into_inner);
        for shot in burst {
            self.daemon.state().enqueue(shot.clone());
        }
        Ok(())
    }

    /// Capture `shot` repeatedly until [`Sensor::stop_streaming`]. Every
    /// repetition gets its own id.
    pub fn stream(&self, shot: &Shot) -> Result<()> {
        self.stream_burst(std::slice::from_ref(shot))
    }

    pub fn stream_burst(&self, burst: &[Shot]) -> Result<()> {
        self.start()?;
        self.daemon.state().source.set(burst.to_vec());
        Ok(())
    }

    pub fn stop_streaming(&self) {
        self.daemon.state().source.clear();
    }

    pub fn streaming(&self) -> bool {
        self.daemon.state().source.is_active()
    }

    /// Block until the next frame is delivered, tagged by every attached
    /// device.
    pub fn get_frame(&self) -> Result<Frame> {
        if !self.daemon.running() {
            return Err(self.stopped());
        }
        match self.daemon.state().frames.pull() {
            Some(frame) => Ok(self.hand_out(frame)),
            None => Err(self.stopped()),
        }
    }

    /// Like [`Sensor::get_frame`] but gives up after `timeout`.
    pub fn try_get_frame(&self, timeout: Duration) -> Result<Option<Frame>> {
        if !self.daemon.running() {
            return Err(self.stopped());
        }
        let frames = &self.daemon.state().frames;
        if !frames.wait(Some(timeout)) {
            return Ok(None);
        }
        Ok(frames.try_pull().map(|frame| self.hand_out(frame)))
    }

    fn hand_out(&self, mut frame: Frame) -> Frame {
        for device in self.daemon.state().devices.load().iter() {
            device.tag_frame(&mut frame);
        }
        self.daemon.state().pending.decrement();
        frame
    }

    fn stopped(&self) -> Error {
        self.events.error(
            EventKind::SensorStopped,
            "frame requested from a stopped sensor",
        );
        Error::SensorStopped
    }

    /// Frames delivered and waiting for [`Sensor::get_frame`].
    pub fn frames_pending(&self) -> usize {
        self.daemon.state().frames.len()
    }

    /// Wanted shots accepted and not yet handed out or dropped.
    pub fn shots_pending(&self) -> usize {
        self.daemon.state().pending.get()
    }

    pub fn set_drop_policy(&self, policy: DropPolicy, limit: usize) {
        self.update_drop_settings(|s| {
            s.policy = policy;
            s.limit = limit;
        });
    }

    pub fn set_frame_limit(&self, limit: usize) {
        self.update_drop_settings(|s| s.limit = limit);
    }

    fn update_drop_settings(&self, f: impl FnOnce(&mut DropSettings)) {
        let state = self.daemon.state();
        let settings = {
            let mut settings = state.lock_drop_settings();
            f(&mut settings);
            *settings
        };
        drop_policy::enforce(&state.frames, settings, &state.pending, &state.events);
    }

    pub fn drop_policy(&self) -> DropPolicy {
        self.daemon.state().drop_settings().policy
    }

    pub fn frame_limit(&self) -> usize {
        self.daemon.state().drop_settings().limit
    }

    /// Tag delivered frames with `device` and let it see sensor events.
    pub fn attach(&self, device: Arc<dyn Device>) {
        self.daemon.state().attach(device);
    }

    /// Receiver for asynchronous errors and warnings. Clones share the queue.
    pub fn events(&self) -> Receiver<Event> {
        self.event_rx.clone()
    }

    pub fn shot_ids(&self) -> &ShotIds {
        &self.ids
    }

    /// A default shot with an id from this sensor.
    pub fn new_shot(&self) -> Shot {
        Shot::new(&self.ids)
    }

    pub fn hal(&self) -> &Arc<dyn CameraHal> {
        &self.hal
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.daemon.state().dispatcher.stats()
    }

    pub fn sensor_config(&self) -> &SensorConfig {
        &self.sensor_config
    }

    pub fn best_mode(&self, size: Size) -> Option<CaptureMode> {
        self.sensor_config.best_mode(size).copied()
    }

    pub fn min_exposure(&self, size: Size) -> Duration {
        self.best_mode(size)
            .map_or(MIN_EXPOSURE, |m| m.min_exposure.max(MIN_EXPOSURE))
    }

    pub fn max_exposure(&self, size: Size) -> Duration {
        self.best_mode(size).map_or(Duration::ZERO, |m| m.max_exposure)
    }

    pub fn min_frame_time(&self, size: Size) -> Duration {
        self.best_mode(size).map_or(Duration::ZERO, |m| m.min_frame_time)
    }

    pub fn max_frame_time(&self, size: Size) -> Duration {
        self.best_mode(size).map_or(Duration::ZERO, |m| m.max_frame_time)
    }

    pub fn min_gain(&self) -> f32 {
        self.sensor_config.min_gain
    }

    pub fn max_gain(&self) -> f32 {
        self.sensor_config.max_gain
    }

    pub fn min_image_size(&self) -> Size {
        self.sensor_config
            .modes
            .iter()
            .map(|m| m.size)
            .min_by_key(|s| s.area())
            .unwrap_or_default()
    }

    pub fn max_image_size(&self) -> Size {
        self.sensor_config
            .modes
            .iter()
            .map(|m| m.size)
            .max_by_key(|s| s.area())
            .unwrap_or_default()
    }

    /// Frames between writing an exposure and seeing it take effect.
    pub fn exposure_latency(&self) -> u32 {
        self.sensor_config.exposure_latency
    }

    pub fn gain_latency(&self) -> u32 {
        self.sensor_config.gain_latency
    }

    /// Time between reading out the first and last rows of `shot`.
    pub fn rolling_shutter_time(&self, shot: &Shot) -> Duration {
        if shot.image.size.height > 960 {
            Duration::from_millis(77)
        } else {
            Duration::from_millis(33)
        }
    }
}

impl Drop for Sensor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::image::PixelFormat;
    use crate::hal::{SimulatedHal, SimulatedHalConfig};

    fn idle_sensor() -> Sensor {
        Sensor::new(Arc::new(SimulatedHal::default()), Config::default())
    }

    #[test]
    fn get_frame_before_start_reports_stopped() {
        let sensor = idle_sensor();
        let events = sensor.events();
        assert!(matches!(sensor.get_frame(), Err(Error::SensorStopped)));
        assert!(matches!(
            sensor.try_get_frame(Duration::from_millis(1)),
            Err(Error::SensorStopped)
        ));
        assert_eq!(events.try_recv().unwrap().kind, EventKind::SensorStopped);
    }

    #[test]
    fn capability_queries_follow_sensor_config() {
        let sensor = idle_sensor();
        let vga = Size::new(640, 480);
        assert_eq!(sensor.best_mode(Size::new(320, 240)).unwrap().size, vga);
        assert_eq!(sensor.min_exposure(vga), Duration::from_millis(1));
        assert_eq!(sensor.max_exposure(vga), Duration::from_millis(900));
        assert_eq!(sensor.min_image_size(), vga);
        assert_eq!(sensor.max_image_size(), Size::new(2592, 1944));
        assert_eq!(sensor.exposure_latency(), 2);
        assert_eq!(sensor.gain_latency(), 1);
        assert_eq!((sensor.min_gain(), sensor.max_gain()), (1.0, 16.0));

        let mut shot = sensor.new_shot();
        assert_eq!(sensor.rolling_shutter_time(&shot), Duration::from_millis(33));
        shot.image.size = Size::new(2592, 1944);
        shot.image.format = PixelFormat::Raw;
        assert_eq!(sensor.rolling_shutter_time(&shot), Duration::from_millis(77));
    }

    #[test]
    fn drop_settings_are_adjustable() {
        let sensor = idle_sensor();
        assert_eq!(sensor.drop_policy(), DropPolicy::DropOldest);
        assert_eq!(sensor.frame_limit(), 128);
        sensor.set_drop_policy(DropPolicy::DropNewest, 3);
        sensor.set_frame_limit(7);
        assert_eq!(sensor.drop_policy(), DropPolicy::DropNewest);
        assert_eq!(sensor.frame_limit(), 7);
    }

    #[test]
    fn streaming_toggles_and_stop_resets() {
        let hal = SimulatedHal::new(SimulatedHalConfig {
            frame_interval: Duration::from_millis(2),
            ..Default::default()
        });
        let sensor = Sensor::new(Arc::new(hal), Config::default());
        let shot = sensor.new_shot();
        sensor.stream(&shot).unwrap();
        assert!(sensor.running());
        assert!(sensor.streaming());

        let frame = sensor.get_frame().unwrap();
        assert!(frame.wanted());
        assert_ne!(frame.id(), shot.id(), "streamed repeats get fresh ids");

        sensor.stop_streaming();
        assert!(!sensor.streaming());
        sensor.stop();
        assert!(!sensor.running());
        assert_eq!(sensor.shots_pending(), 0);
        assert_eq!(sensor.frames_pending(), 0);
    }
}
