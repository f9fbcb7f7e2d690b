pub mod capture;
pub mod device;
pub mod error;
pub mod events;
pub mod hal;
pub mod pipeline;
pub mod sensor;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Action, ActionPayload, Frame, Image, PixelFormat, Shot, ShotIds, Size};
pub use error::{Error, Result};
pub use events::{Event, EventKind, Severity};
pub use pipeline::drop_policy::DropPolicy;
pub use pipeline::rt::ThreadPriority;
pub use sensor::Sensor;

/// Daemon configuration
///
/// Every section falls back to its defaults, so a partial TOML file (or none
/// at all) is fine. Environment variables override the file, e.g.
/// `SENSORD__PIPELINE__FRAME_LIMIT=16`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    pub pipeline: PipelineConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub priority: ThreadPriority,
    pub cpu_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub priority: ThreadPriority,
    pub cpu_core: Option<usize>,
    /// How long before a deadline the dispatcher stops sleeping and spins.
    pub spin_window_us: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_limit: usize,
    pub drop_policy: DropPolicy,
    /// Bound on waiting for a fixed image target held by the client. The
    /// driver callback thread waits on it, so it can never be unbounded.
    pub image_lock_timeout_us: u64,
    pub shutdown_drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            priority: ThreadPriority::RealtimeMin,
            cpu_core: None,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            priority: ThreadPriority::RealtimeMax,
            cpu_core: None,
            spin_window_us: 500,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_limit: 128,
            drop_policy: DropPolicy::DropOldest,
            image_lock_timeout_us: 10_000,
            shutdown_drain_timeout_ms: 1_000,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

impl DispatcherConfig {
    pub fn spin_window(&self) -> Duration {
        Duration::from_micros(self.spin_window_us)
    }
}

/// Ceiling on [`PipelineConfig::image_lock_timeout_us`].
const MAX_IMAGE_LOCK_WAIT_US: u64 = 1_000_000;

impl PipelineConfig {
    /// The fixed-target lock wait in the form [`Image::lock`] takes, capped
    /// at one second.
    pub fn image_lock_timeout(&self) -> i64 {
        self.image_lock_timeout_us.min(MAX_IMAGE_LOCK_WAIT_US) as i64
    }

    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_timeout_ms)
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `SENSORD__*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("SENSORD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.pipeline.frame_limit, 128);
        assert_eq!(config.pipeline.drop_policy, DropPolicy::DropOldest);
        assert_eq!(config.pipeline.image_lock_timeout_us, 10_000);
        assert_eq!(config.dispatcher.spin_window(), Duration::from_micros(500));
        assert_eq!(config.dispatcher.priority, ThreadPriority::RealtimeMax);
        assert_eq!(config.scheduler.priority, ThreadPriority::RealtimeMin);
        assert_eq!(config.events.capacity, 256);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[pipeline]\nframe_limit = 4\ndrop_policy = \"drop-newest\"\n\n[dispatcher]\nspin_window_us = 250"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.pipeline.frame_limit, 4);
        assert_eq!(config.pipeline.drop_policy, DropPolicy::DropNewest);
        assert_eq!(config.pipeline.image_lock_timeout_us, 10_000);
        assert_eq!(config.dispatcher.spin_window_us, 250);
        assert_eq!(config.events.capacity, 256);
    }

    #[test]
    fn image_lock_wait_is_always_bounded() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pipeline]\nimage_lock_timeout_us = -1").unwrap();
        assert!(matches!(Config::load(Some(file.path())), Err(Error::Config(_))));

        let mut pipeline = PipelineConfig::default();
        assert_eq!(pipeline.image_lock_timeout(), 10_000);
        pipeline.image_lock_timeout_us = u64::MAX;
        assert_eq!(pipeline.image_lock_timeout(), 1_000_000);
        pipeline.image_lock_timeout_us = 0;
        assert_eq!(pipeline.image_lock_timeout(), 0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/sensord.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
