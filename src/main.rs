//! sensord demo: drives the capture pipeline against the simulated sensor

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use sensord::capture::shot::ImageTarget;
use sensord::device::{Flash, Lens};
use sensord::hal::{CameraHal, SimulatedHal};
use sensord::{Action, Config, PixelFormat, Sensor, Size};

const STREAM_FRAMES: usize = 30;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sensord=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("sensord launching...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    info!(?config, "configuration loaded");

    let hal: Arc<dyn CameraHal> = Arc::new(SimulatedHal::default());
    let sensor = Sensor::new(hal.clone(), config);
    let lens = Lens::new(hal.clone());
    let flash = Flash::new(hal);
    sensor.attach(lens.clone());
    sensor.attach(flash.clone());
    let events = sensor.events();

    // Viewfinder: VGA preview with a luma histogram.
    let mut preview = sensor.new_shot();
    preview.image = ImageTarget::auto(Size::new(640, 480), PixelFormat::Yuv420p);
    preview.exposure = Duration::from_millis(20);
    preview.histogram.enabled = true;
    sensor.stream(&preview)?;

    for n in 0..STREAM_FRAMES {
        let frame = sensor.get_frame()?;
        if n % 10 == 0 {
            let mean_bucket = frame.histogram.as_ref().map(|h| {
                let total = h.total(0).max(1);
                (0..h.buckets()).map(|b| b as u64 * u64::from(h.get(b, 0))).sum::<u64>() / total
            });
            info!(
                id = frame.id(),
                exposure_us = frame.exposure.as_micros() as u64,
                gain = frame.gain,
                ?mean_bucket,
                "preview frame"
            );
        }
    }
    sensor.stop_streaming();

    // Full-resolution bracket, the middle shot with flash and a focus move.
    let full = Size::new(2592, 1944);
    let burst: Vec<_> = [10u64, 30, 60]
        .into_iter()
        .enumerate()
        .map(|(i, ms)| {
            let mut shot = sensor.new_shot();
            shot.image = ImageTarget::auto(full, PixelFormat::Raw);
            shot.exposure = Duration::from_millis(ms);
            shot.frame_time = Duration::from_millis(ms).max(Duration::from_millis(66));
            if i == 1 {
                shot.add_action(Action::flash_fire(
                    &flash,
                    Duration::from_millis(ms / 2),
                    1.0,
                    Duration::from_millis(5),
                ));
                shot.add_action(Action::lens_focus(&lens, Duration::ZERO, lens.near_focus() / 2.0));
            }
            shot
        })
        .collect();
    sensor.capture_burst(&burst)?;

    // Preview frames still in the pipeline come out first.
    let mut remaining: Vec<u64> = burst.iter().map(|s| s.id()).collect();
    while !remaining.is_empty() {
        let frame = sensor.get_frame()?;
        if !remaining.contains(&frame.id()) {
            continue;
        }
        remaining.retain(|&id| id != frame.id());
        let tags: Vec<_> = frame.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        info!(
            id = frame.id(),
            exposure_us = frame.exposure.as_micros() as u64,
            valid = frame.image.valid(),
            tags = %tags.join(" "),
            "burst frame"
        );
    }

    let stats = sensor.dispatcher_stats();
    info!(
        fired = stats.fired,
        max_lateness_us = stats.max_lateness.as_micros() as u64,
        "action dispatcher"
    );
    for event in events.try_iter() {
        warn!("{event}");
    }

    sensor.stop();
    info!("sensord shutting down");
    Ok(())
}
