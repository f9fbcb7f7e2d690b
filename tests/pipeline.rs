mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{sensor, sensor_with, wait_for};
use sensord::capture::shot::ImageTarget;
use sensord::capture::{Confidence, TagValue};
use sensord::device::Lens;
use sensord::{Config, DropPolicy, Error, EventKind, PixelFormat, Size};

const VGA: Size = Size {
    width: 640,
    height: 480,
};
const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn every_capture_is_delivered_in_submission_order() {
    let (_hal, sensor) = sensor();
    let shots: Vec<_> = (0..10)
        .map(|i| {
            let mut shot = sensor.new_shot();
            shot.image = ImageTarget::auto(VGA, PixelFormat::Yuv420p);
            shot.gain = if i % 2 == 0 { 1.0 } else { 2.0 };
            shot
        })
        .collect();
    for shot in &shots {
        sensor.capture(shot).unwrap();
    }
    assert_eq!(sensor.shots_pending(), 10);

    let delivered: Vec<_> = (0..shots.len())
        .map(|_| sensor.try_get_frame(TIMEOUT).unwrap().expect("frame"))
        .collect();
    let ids: Vec<_> = delivered.iter().map(|f| f.id()).collect();
    assert_eq!(ids, shots.iter().map(|s| s.id()).collect::<Vec<_>>());
    for frame in &delivered {
        assert!(frame.wanted());
        assert!(frame.image.valid());
        assert!(frame.confidence.contains(Confidence::MATCH_REQUEST));
    }
    assert_eq!(sensor.shots_pending(), 0);
}

#[test]
fn bubbles_never_reach_the_client() {
    let (_hal, sensor) = sensor();
    let mut short = sensor.new_shot();
    short.exposure = Duration::from_millis(5);
    let mut long = sensor.new_shot();
    long.exposure = Duration::from_millis(15);
    sensor.stream_burst(&[short, long]).unwrap();

    let mut last = 0;
    for _ in 0..12 {
        let frame = sensor.try_get_frame(TIMEOUT).unwrap().expect("frame");
        assert!(frame.wanted());
        assert!(frame.id() > last, "delivery order follows submission");
        last = frame.id();
    }
    sensor.stop();
}

#[test]
fn drop_oldest_keeps_the_latest_frames() {
    let (_hal, sensor) = sensor();
    sensor.set_drop_policy(DropPolicy::DropOldest, 5);
    let events = sensor.events();

    let shots: Vec<_> = (0..7).map(|_| sensor.new_shot()).collect();
    sensor.capture_burst(&shots).unwrap();

    // Seven delivered, two evicted.
    assert!(wait_for(TIMEOUT, || sensor.shots_pending() == 5
        && sensor.frames_pending() == 5));
    let ids: Vec<_> = (0..5).map(|_| sensor.get_frame().unwrap().id()).collect();
    assert_eq!(ids, shots[2..].iter().map(|s| s.id()).collect::<Vec<_>>());
    assert!(events.try_iter().any(|e| e.kind == EventKind::FrameLimitHit));
}

#[test]
fn identical_geometry_switches_mode_once() {
    let (hal, sensor) = sensor();
    let shots: Vec<_> = (0..5)
        .map(|_| {
            let mut shot = sensor.new_shot();
            shot.image = ImageTarget::auto(VGA, PixelFormat::Yuv420p);
            shot
        })
        .collect();
    sensor.capture_burst(&shots).unwrap();
    for _ in &shots {
        sensor.try_get_frame(TIMEOUT).unwrap().expect("frame");
    }
    assert_eq!(hal.mode_switches(), 1);
}

#[test]
fn failed_mode_switch_still_delivers_the_frame() {
    let (hal, sensor) = sensor();
    let events = sensor.events();
    sensor.capture(&sensor.new_shot()).unwrap();
    sensor.try_get_frame(TIMEOUT).unwrap().expect("first frame");

    hal.sim.fail_next_mode_switch();
    let mut hd = sensor.new_shot();
    hd.image = ImageTarget::auto(Size::new(1280, 720), PixelFormat::Yuv420p);
    sensor.capture(&hd).unwrap();

    let frame = sensor.try_get_frame(TIMEOUT).unwrap().expect("frame");
    assert_eq!(frame.id(), hd.id());
    assert!(!frame.image.valid());
    assert!(events.try_iter().any(|e| e.kind == EventKind::DriverError));

    // The next request retries the switch and gets pixels.
    sensor.capture(&hd).unwrap();
    let frame = sensor.try_get_frame(TIMEOUT).unwrap().expect("frame");
    assert!(frame.image.valid());
    assert_eq!(frame.image.size(), Size::new(1280, 720));
}

#[test]
fn failed_trigger_still_delivers_the_frame() {
    let (hal, sensor) = sensor();
    let shot = sensor.new_shot();
    hal.sim.fail_next_capture();
    sensor.capture(&shot).unwrap();
    let frame = sensor.try_get_frame(TIMEOUT).unwrap().expect("frame");
    assert_eq!(frame.id(), shot.id());
}

#[test]
fn auto_allocated_frames_can_be_converted_to_rgb() {
    let (_hal, sensor) = sensor();
    let mut shot = sensor.new_shot();
    shot.image = ImageTarget::auto(VGA, PixelFormat::Rgb24);
    shot.histogram.enabled = true;
    sensor.capture(&shot).unwrap();

    let frame = sensor.try_get_frame(TIMEOUT).unwrap().expect("frame");
    assert_eq!(frame.image.format(), PixelFormat::Rgb24);
    assert!(frame.image.valid());
    let histogram = frame.histogram.expect("histogram");
    assert!(histogram.total(0) > 0);
}

#[test]
fn attached_lens_tags_frames() {
    let (hal, sensor) = sensor();
    let lens = Lens::new(hal);
    sensor.attach(lens.clone());
    sensor.capture(&sensor.new_shot()).unwrap();

    let frame = sensor.try_get_frame(TIMEOUT).unwrap().expect("frame");
    assert!(frame.exposure_start.is_some());
    assert_eq!(frame.get_tag("lens.zoom"), Some(&TagValue::Float(4.0)));
    assert!(frame.get_tag("lens.focus").is_some());
}

#[test]
fn stop_wakes_a_blocked_consumer() {
    let (_hal, sensor) = sensor();
    let sensor = Arc::new(sensor);
    sensor.capture(&sensor.new_shot()).unwrap();
    sensor.try_get_frame(TIMEOUT).unwrap().expect("frame");

    let consumer = {
        let sensor = sensor.clone();
        thread::spawn(move || sensor.get_frame())
    };
    thread::sleep(Duration::from_millis(20));
    let start = Instant::now();
    sensor.stop();
    assert!(matches!(consumer.join().unwrap(), Err(Error::SensorStopped)));
    assert!(start.elapsed() < TIMEOUT);
    assert!(!sensor.running());
}

#[test]
fn configured_drop_newest_keeps_the_earliest_frames() {
    let mut config = Config::default();
    config.pipeline.frame_limit = 2;
    config.pipeline.drop_policy = DropPolicy::DropNewest;
    let (_hal, sensor) = sensor_with(config);
    assert_eq!(sensor.frame_limit(), 2);

    let shots: Vec<_> = (0..4).map(|_| sensor.new_shot()).collect();
    sensor.capture_burst(&shots).unwrap();
    assert!(wait_for(TIMEOUT, || sensor.shots_pending() == 2));
    let first = sensor.get_frame().unwrap();
    assert_eq!(first.id(), shots[0].id());
}

#[test]
fn stopped_sensor_restarts_on_the_next_capture() {
    let (_hal, sensor) = sensor();
    let first = sensor.new_shot();
    sensor.capture(&first).unwrap();
    assert_eq!(sensor.try_get_frame(TIMEOUT).unwrap().map(|f| f.id()), Some(first.id()));

    sensor.stop();
    assert!(!sensor.running());

    let second = sensor.new_shot();
    sensor.capture(&second).unwrap();
    assert!(sensor.running());
    assert_eq!(sensor.get_frame().unwrap().id(), second.id());

    let third = sensor.new_shot();
    sensor.capture(&third).unwrap();
    assert_eq!(sensor.try_get_frame(TIMEOUT).unwrap().map(|f| f.id()), Some(third.id()));
    assert_eq!(sensor.shots_pending(), 0);
    sensor.stop();
}
