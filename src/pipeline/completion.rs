//! Matching driver completions to in-flight requests
//!
//! Runs on the driver's callback thread. Completions are matched to the
//! in-flight queue strictly in trigger order; the driver never reorders.

use std::time::Instant;

use tracing::trace;

use super::DaemonState;
use crate::capture::convert;
use crate::capture::frame::Frame;
use crate::capture::image::Image;
use crate::capture::shot::Allocation;
use crate::capture::statistics::{evaluate_histogram, evaluate_variance};
use crate::events::EventKind;
use crate::hal::HardwareFrame;

pub(crate) struct FrameCompletionHandler<'a> {
    state: &'a DaemonState,
}

impl<'a> FrameCompletionHandler<'a> {
    pub fn new(state: &'a DaemonState) -> Self {
        Self { state }
    }

    pub fn handle(&self, hw: HardwareFrame) {
        let Some(mut frame) = self.state.in_flight.try_pull() else {
            // Startup or mode-switch leftovers the scheduler never asked for.
            trace!("discarding unmatched completion");
            return;
        };

        frame.exposure = hw.exposure;
        frame.frame_time = hw.frame_time;
        frame.gain = hw.gain;
        frame.exposure_end = Some(hw.exposure_end);
        frame.exposure_start = hw.exposure_end.checked_sub(hw.frame_time);
        frame.processing_done = Some(hw.processing_done);

        if !frame.wanted() {
            trace!(id = frame.id(), "bubble complete");
            return;
        }

        if hw.image.valid() {
            self.compute_statistics(&mut frame, &hw.image);
            frame.image = self.resolve_image(&frame, &hw.image);
        } else {
            self.state.events.error(
                EventKind::ImageDroppedError,
                format!("driver returned no image data for shot {}", frame.id()),
            );
            let target = &frame.shot().image;
            frame.image = Image::placeholder(target.size, target.format);
        }

        metrics::histogram!("sensord.completion_latency_us")
            .record(Instant::now().saturating_duration_since(hw.exposure_end).as_micros() as f64);
        self.state.deliver(frame);
    }

    fn compute_statistics(&self, frame: &mut Frame, image: &Image) {
        // Both return `None` unless enabled on the shot.
        let sharpness = evaluate_variance(&frame.shot().sharpness, image);
        let histogram = evaluate_histogram(&frame.shot().histogram, image);
        frame.sharpness = sharpness;
        frame.histogram = histogram;
    }

    /// The image the client gets, per the shot's allocation policy. Any
    /// mismatch degrades to a placeholder; the frame is still delivered.
    fn resolve_image(&self, frame: &Frame, hw: &Image) -> Image {
        let id = frame.id();
        let target = &frame.shot().image;
        let placeholder = || Image::placeholder(target.size, target.format);

        match &target.allocation {
            Allocation::Discard => placeholder(),
            Allocation::AutoAllocate if hw.format() == target.format => {
                // Driver buffers are immutable, so aliasing them is safe.
                if hw.is_weak() {
                    hw.clone()
                } else {
                    hw.copy()
                }
            }
            Allocation::AutoAllocate => match convert::convert(hw, target.format) {
                Some(image) => image,
                None => {
                    self.state.events.warning(
                        EventKind::FormatMismatch,
                        format!(
                            "cannot convert {:?} to {:?} for shot {id}",
                            hw.format(),
                            target.format
                        ),
                    );
                    placeholder()
                }
            },
            Allocation::Fixed(image) => self.write_fixed(id, hw, image),
        }
    }

    fn write_fixed(&self, id: u64, hw: &Image, target: &Image) -> Image {
        let dropped = || Image::placeholder(target.size(), target.format());

        if target.size() != hw.size() {
            self.state.events.warning(
                EventKind::ResolutionMismatch,
                format!(
                    "target image for shot {id} is {}x{}, capture is {}x{}",
                    target.width(),
                    target.height(),
                    hw.width(),
                    hw.height()
                ),
            );
            return dropped();
        }
        if !convert::can_convert(hw.format(), target.format()) {
            self.state.events.warning(
                EventKind::FormatMismatch,
                format!(
                    "cannot write {:?} into {:?} target for shot {id}",
                    hw.format(),
                    target.format()
                ),
            );
            return dropped();
        }

        if !target.lockable() {
            self.state.events.error(
                EventKind::ImageLockError,
                format!("target image for shot {id} has no lock and cannot be written"),
            );
            return dropped();
        }

        let timeout_us = self.state.config.pipeline.image_lock_timeout();
        let Some(guard) = target.lock_guard(timeout_us) else {
            self.state.events.warning(
                EventKind::ImageTargetLocked,
                format!("target image for shot {id} still locked after {timeout_us}us, dropping pixels"),
            );
            return dropped();
        };
        let written = convert::convert_into(hw, guard.image());
        drop(guard);
        if !written {
            self.state.events.warning(
                EventKind::FormatMismatch,
                format!(
                    "failed to write {:?} capture into {:?} target for shot {id}",
                    hw.format(),
                    target.format()
                ),
            );
            return dropped();
        }
        target.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::image::{PixelFormat, Size};
    use crate::capture::shot::{ImageTarget, Shot, ShotIds};
    use crate::events::{Event, EventSink};
    use crate::hal::SimulatedHal;
    use crate::pipeline::CaptureDaemon;
    use crate::Config;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        daemon: Arc<CaptureDaemon>,
        ids: ShotIds,
        events: flume::Receiver<Event>,
    }

    fn harness() -> Harness {
        let (sink, events) = EventSink::bounded(64);
        let ids = ShotIds::new();
        let daemon = CaptureDaemon::new(
            Arc::new(SimulatedHal::default()),
            Config::default(),
            sink,
            ids.clone(),
        );
        Harness { daemon, ids, events }
    }

    impl Harness {
        fn in_flight(&self, target: ImageTarget, wanted: bool) -> u64 {
            let mut shot = Shot::new(&self.ids);
            shot.image = target;
            shot.wanted = wanted;
            let id = shot.id();
            self.daemon.state().in_flight.push(Frame::from_shot(shot));
            id
        }

        fn complete(&self, image: Image) {
            let end = Instant::now();
            FrameCompletionHandler::new(self.daemon.state()).handle(HardwareFrame {
                image,
                exposure: Duration::from_millis(12),
                frame_time: Duration::from_millis(40),
                gain: 2.0,
                white_balance: 5000,
                exposure_end: end,
                processing_done: end,
            });
        }

        fn delivered(&self) -> Option<Frame> {
            self.daemon.state().frames.try_pull()
        }

        fn saw(&self, kind: EventKind) -> bool {
            self.events.try_iter().any(|e| e.kind == kind)
        }
    }

    const SIZE: Size = Size {
        width: 8,
        height: 8,
    };

    fn yuv(luma: u8) -> Image {
        let mut data = vec![luma; 64];
        data.extend(std::iter::repeat(128u8).take(32));
        Image::from_bytes(SIZE, PixelFormat::Yuv420p, Bytes::from(data), None).unwrap()
    }

    #[test]
    fn unmatched_completion_is_ignored() {
        let h = harness();
        h.complete(yuv(10));
        assert!(h.delivered().is_none());
    }

    #[test]
    fn bubbles_never_reach_the_client() {
        let h = harness();
        h.in_flight(ImageTarget::auto(SIZE, PixelFormat::Yuv420p), false);
        h.complete(yuv(10));
        assert!(h.delivered().is_none());
        assert!(h.daemon.state().in_flight.is_empty());
    }

    #[test]
    fn auto_allocate_adopts_driver_buffer_and_stamps_actuals() {
        let h = harness();
        let id = h.in_flight(ImageTarget::auto(SIZE, PixelFormat::Yuv420p), true);
        let hw = yuv(42);
        h.complete(hw.clone());

        let frame = h.delivered().unwrap();
        assert_eq!(frame.id(), id);
        assert_eq!(frame.image, hw);
        assert_eq!(frame.exposure, Duration::from_millis(12));
        assert_eq!(frame.gain, 2.0);
        assert_eq!(
            frame.exposure_end.unwrap() - frame.exposure_start.unwrap(),
            Duration::from_millis(40)
        );
    }

    #[test]
    fn auto_allocate_converts_to_rgb() {
        let h = harness();
        h.in_flight(ImageTarget::auto(SIZE, PixelFormat::Rgb24), true);
        h.complete(yuv(100));
        let frame = h.delivered().unwrap();
        assert!(frame.image.valid());
        assert_eq!(frame.image.format(), PixelFormat::Rgb24);
        assert!(!frame.image.is_weak());
    }

    #[test]
    fn discard_target_keeps_only_metadata() {
        let h = harness();
        h.in_flight(ImageTarget::discard(SIZE, PixelFormat::Yuv420p), true);
        h.complete(yuv(1));
        let frame = h.delivered().unwrap();
        assert!(!frame.image.valid());
        assert_eq!(frame.image.size(), SIZE);
    }

    #[test]
    fn fixed_target_receives_pixels() {
        let h = harness();
        let target = Image::new(SIZE, PixelFormat::Yuv420p);
        h.in_flight(ImageTarget::fixed(target.clone()), true);
        h.complete(yuv(77));

        let frame = h.delivered().unwrap();
        assert_eq!(frame.image, target);
        assert_eq!(target.with_pixels(|p| p[0]), Some(77));
    }

    #[test]
    fn locked_fixed_target_drops_pixels_but_delivers() {
        let h = harness();
        let target = Image::new(SIZE, PixelFormat::Yuv420p);
        let id = h.in_flight(ImageTarget::fixed(target.clone()), true);

        let client = target.clone();
        let held = client.lock_guard(-1).unwrap();
        h.complete(yuv(77));
        drop(held);

        let frame = h.delivered().unwrap();
        assert_eq!(frame.id(), id);
        assert!(!frame.image.valid());
        assert_eq!(target.with_pixels(|p| p[0]), Some(0));
        assert!(h.saw(EventKind::ImageTargetLocked));
    }

    #[test]
    fn mismatched_fixed_target_is_reported() {
        let h = harness();
        let target = Image::new(Size::new(4, 4), PixelFormat::Yuv420p);
        h.in_flight(ImageTarget::fixed(target), true);
        h.complete(yuv(77));
        assert!(!h.delivered().unwrap().image.valid());
        assert!(h.saw(EventKind::ResolutionMismatch));

        let raw = Image::new(SIZE, PixelFormat::Raw);
        h.in_flight(ImageTarget::fixed(raw), true);
        h.complete(yuv(77));
        assert!(!h.delivered().unwrap().image.valid());
        assert!(h.saw(EventKind::FormatMismatch));
    }

    #[test]
    fn unlockable_fixed_target_is_reported() {
        let h = harness();
        let id = h.in_flight(
            ImageTarget::fixed(Image::placeholder(SIZE, PixelFormat::Yuv420p)),
            true,
        );
        h.complete(yuv(77));
        assert_eq!(h.delivered().map(|f| f.id()), Some(id));
        assert!(h.saw(EventKind::ImageLockError));

        // Aliased driver memory is read-only and has no lock either.
        h.in_flight(ImageTarget::fixed(yuv(3)), true);
        h.complete(yuv(77));
        assert!(!h.delivered().unwrap().image.valid());
        assert!(h.saw(EventKind::ImageLockError));
    }

    #[test]
    fn failed_write_into_fixed_target_drops_pixels() {
        let h = harness();
        let half = Size::new(4, 8);
        let target = Image::new(half, PixelFormat::Rgb24);
        let id = h.in_flight(ImageTarget::fixed(target.clone()), true);

        // A column view keeps the parent's stride, so its chroma planes run
        // past the end of the shared buffer.
        h.complete(yuv(77).sub_image(4, 0, half));

        let frame = h.delivered().unwrap();
        assert_eq!(frame.id(), id);
        assert!(!frame.image.valid());
        assert_eq!(frame.image.size(), half);
        assert!(h.saw(EventKind::FormatMismatch));
        assert!(target.lock(0), "lock released after the failed write");
        target.unlock();
    }

    #[test]
    fn missing_driver_data_still_delivers() {
        let h = harness();
        let id = h.in_flight(ImageTarget::auto(SIZE, PixelFormat::Yuv420p), true);
        h.complete(Image::placeholder(SIZE, PixelFormat::Yuv420p));
        assert_eq!(h.delivered().map(|f| f.id()), Some(id));
        assert!(h.saw(EventKind::ImageDroppedError));
    }

    #[test]
    fn statistics_only_when_enabled() {
        let h = harness();
        h.in_flight(ImageTarget::discard(SIZE, PixelFormat::Yuv420p), true);
        h.complete(yuv(5));
        let plain = h.delivered().unwrap();
        assert!(plain.histogram.is_none() && plain.sharpness.is_none());

        let mut shot = Shot::new(&h.ids);
        shot.image = ImageTarget::discard(SIZE, PixelFormat::Yuv420p);
        shot.histogram.enabled = true;
        shot.sharpness.enabled = true;
        shot.sharpness.size = Size::new(2, 2);
        h.daemon.state().in_flight.push(Frame::from_shot(shot));
        h.complete(yuv(5));
        let measured = h.delivered().unwrap();
        assert!(measured.histogram.is_some());
        assert!(measured.sharpness.is_some());
    }
}
