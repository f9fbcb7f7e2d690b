//! Client-side capture description
//!
//! A [`Shot`] says what to capture; the scheduler turns it into a frame in
//! flight. Ids come from a [`ShotIds`] factory owned by the sensor, never from
//! a process-wide counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::action::Action;
use super::image::{Image, PixelFormat, Rect, Size};

/// Hands out strictly increasing shot ids. Clones share the same counter.
#[derive(Debug, Clone)]
pub struct ShotIds {
    next: Arc<AtomicU64>,
}

impl Default for ShotIds {
    fn default() -> Self {
        Self::new()
    }
}

impl ShotIds {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// What to do with the pixels once the frame completes.
#[derive(Debug, Clone, PartialEq)]
pub enum Allocation {
    /// Keep only the metadata.
    Discard,
    /// Hand the client a buffer, zero-copy when the hardware allows it.
    AutoAllocate,
    /// Write into this pre-allocated image.
    Fixed(Image),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageTarget {
    pub size: Size,
    pub format: PixelFormat,
    pub allocation: Allocation,
}

impl ImageTarget {
    pub fn discard(size: Size, format: PixelFormat) -> Self {
        Self {
            size,
            format,
            allocation: Allocation::Discard,
        }
    }

    pub fn auto(size: Size, format: PixelFormat) -> Self {
        Self {
            size,
            format,
            allocation: Allocation::AutoAllocate,
        }
    }

    /// Capture into `image`. Size and format follow the image.
    pub fn fixed(image: Image) -> Self {
        Self {
            size: image.size(),
            format: image.format(),
            allocation: Allocation::Fixed(image),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramConfig {
    pub enabled: bool,
    /// Region of the image to sample. An empty region covers the whole image.
    pub region: Rect,
    pub buckets: u32,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            region: Rect::default(),
            buckets: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SharpnessConfig {
    pub enabled: bool,
    pub size: Size,
}

#[derive(Debug, Clone)]
pub struct Shot {
    id: u64,
    pub image: ImageTarget,
    pub exposure: Duration,
    pub frame_time: Duration,
    pub gain: f32,
    /// Kelvin.
    pub white_balance: u32,
    pub histogram: HistogramConfig,
    pub sharpness: SharpnessConfig,
    /// Unwanted shots are captured but never delivered.
    pub wanted: bool,
    /// Accept frames captured while exposure or gain were still settling.
    pub fast_mode: bool,
    pub color_matrix: Option<[f32; 12]>,
    actions: Vec<Action>,
}

impl Shot {
    pub fn new(ids: &ShotIds) -> Self {
        Self {
            id: ids.next_id(),
            image: ImageTarget::discard(Size::new(640, 480), PixelFormat::Yuv420p),
            exposure: Duration::from_millis(10),
            frame_time: Duration::from_micros(33_333),
            gain: 1.0,
            white_balance: 5000,
            histogram: HistogramConfig::default(),
            sharpness: SharpnessConfig::default(),
            wanted: true,
            fast_mode: false,
            color_matrix: None,
            actions: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Copy with its own action set and a fresh id. `Clone` keeps the id and
    /// is what the pipeline uses to carry a submitted shot along.
    pub fn duplicate(&self, ids: &ShotIds) -> Self {
        Self {
            id: ids.next_id(),
            ..self.clone()
        }
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn add_action(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// Remove the actions belonging to one device.
    pub fn clear_actions(&mut self, owner: u64) {
        self.actions.retain(|a| a.owner != Some(owner));
    }

    pub fn clear_all_actions(&mut self) {
        self.actions.clear();
    }

    pub fn set_color_matrix(&mut self, matrix: [f32; 12]) {
        self.color_matrix = Some(matrix);
    }

    pub fn clear_color_matrix(&mut self) {
        self.color_matrix = None;
    }
}
