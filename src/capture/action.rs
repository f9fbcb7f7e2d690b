//! Deadline-bearing side effects attached to shots

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::device::{Device, Flash, Lens};

/// Everything an action can do. Ordering in the dispatcher never looks at
/// the payload, only at the deadline.
#[derive(Clone)]
pub enum ActionPayload {
    FlashFire {
        flash: Arc<Flash>,
        brightness: f32,
        duration: Duration,
    },
    FlashTorch {
        flash: Arc<Flash>,
        brightness: f32,
    },
    LensFocus {
        lens: Arc<Lens>,
        diopters: f32,
        speed: Option<f32>,
    },
    /// Move focus by `step` diopters each time it fires, until the shared
    /// repeat budget runs out. Streams use this for focus sweeps.
    LensStepFocus {
        lens: Arc<Lens>,
        step: f32,
        speed: Option<f32>,
        remaining: Arc<AtomicU32>,
    },
    LensZoom {
        lens: Arc<Lens>,
        focal_length: f32,
    },
    LensAperture {
        lens: Arc<Lens>,
        aperture: f32,
    },
    Custom(Arc<dyn Fn() + Send + Sync>),
}

impl ActionPayload {
    pub fn custom(f: impl Fn() + Send + Sync + 'static) -> Self {
        ActionPayload::Custom(Arc::new(f))
    }

    fn owner(&self) -> Option<u64> {
        match self {
            ActionPayload::FlashFire { flash, .. } | ActionPayload::FlashTorch { flash, .. } => {
                Some(flash.id())
            }
            ActionPayload::LensFocus { lens, .. }
            | ActionPayload::LensStepFocus { lens, .. }
            | ActionPayload::LensZoom { lens, .. }
            | ActionPayload::LensAperture { lens, .. } => Some(lens.id()),
            ActionPayload::Custom(_) => None,
        }
    }

    fn latency(&self) -> Duration {
        match self {
            ActionPayload::FlashFire { flash, .. } | ActionPayload::FlashTorch { flash, .. } => {
                flash.fire_latency()
            }
            ActionPayload::LensFocus { lens, .. } | ActionPayload::LensStepFocus { lens, .. } => {
                lens.focus_latency()
            }
            ActionPayload::LensZoom { lens, .. } => lens.zoom_latency(),
            ActionPayload::LensAperture { lens, .. } => lens.aperture_latency(),
            ActionPayload::Custom(_) => Duration::ZERO,
        }
    }
}

impl fmt::Debug for ActionPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionPayload::FlashFire {
                brightness,
                duration,
                ..
            } => f
                .debug_struct("FlashFire")
                .field("brightness", brightness)
                .field("duration", duration)
                .finish(),
            ActionPayload::FlashTorch { brightness, .. } => f
                .debug_struct("FlashTorch")
                .field("brightness", brightness)
                .finish(),
            ActionPayload::LensFocus { diopters, speed, .. } => f
                .debug_struct("LensFocus")
                .field("diopters", diopters)
                .field("speed", speed)
                .finish(),
            ActionPayload::LensStepFocus {
                step, remaining, ..
            } => f
                .debug_struct("LensStepFocus")
                .field("step", step)
                .field("remaining", &remaining.load(Ordering::Relaxed))
                .finish(),
            ActionPayload::LensZoom { focal_length, .. } => f
                .debug_struct("LensZoom")
                .field("focal_length", focal_length)
                .finish(),
            ActionPayload::LensAperture { aperture, .. } => f
                .debug_struct("LensAperture")
                .field("aperture", aperture)
                .finish(),
            ActionPayload::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Action {
    /// Offset from the start of the frame's exposure.
    pub time: Duration,
    /// Time between invoking the payload and its physical effect.
    pub latency: Duration,
    /// Device that created the action, for `Shot::clear_actions`.
    pub owner: Option<u64>,
    pub payload: ActionPayload,
}

impl Action {
    /// Latency and owner are taken from the device the payload drives.
    pub fn new(time: Duration, payload: ActionPayload) -> Self {
        Self {
            time,
            latency: payload.latency(),
            owner: payload.owner(),
            payload,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn owned_by(mut self, owner: u64) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn flash_fire(flash: &Arc<Flash>, time: Duration, brightness: f32, duration: Duration) -> Self {
        Self::new(
            time,
            ActionPayload::FlashFire {
                flash: flash.clone(),
                brightness,
                duration,
            },
        )
    }

    pub fn lens_focus(lens: &Arc<Lens>, time: Duration, diopters: f32) -> Self {
        Self::new(
            time,
            ActionPayload::LensFocus {
                lens: lens.clone(),
                diopters,
                speed: None,
            },
        )
    }

    pub fn lens_step_focus(lens: &Arc<Lens>, time: Duration, step: f32, repeats: u32) -> Self {
        Self::new(
            time,
            ActionPayload::LensStepFocus {
                lens: lens.clone(),
                step,
                speed: None,
                remaining: Arc::new(AtomicU32::new(repeats)),
            },
        )
    }

    pub fn execute(&self) {
        match &self.payload {
            ActionPayload::FlashFire {
                flash,
                brightness,
                duration,
            } => flash.fire(*brightness, *duration),
            ActionPayload::FlashTorch { flash, brightness } => flash.torch(*brightness),
            ActionPayload::LensFocus {
                lens,
                diopters,
                speed,
            } => lens.set_focus(*diopters, *speed),
            ActionPayload::LensStepFocus {
                lens,
                step,
                speed,
                remaining,
            } => {
                let stepped = remaining
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                    .is_ok();
                if stepped {
                    lens.set_focus(lens.focus() + step, *speed);
                }
            }
            ActionPayload::LensZoom { lens, focal_length } => lens.set_zoom(*focal_length),
            ActionPayload::LensAperture { lens, aperture } => lens.set_aperture(*aperture),
            ActionPayload::Custom(f) => f(),
        }
    }

    /// Turn off any state a single-shot fire left on its device, so it does
    /// not leak into the next capture. Returns whether anything was undone.
    pub fn retire(&self) -> bool {
        match &self.payload {
            ActionPayload::FlashFire {
                flash, brightness, ..
            } if *brightness > 0.0 => {
                flash.fire(0.0, Duration::ZERO);
                true
            }
            _ => false,
        }
    }
}
