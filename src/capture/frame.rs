//! Frames in flight and delivered frames
//!
//! The scheduler creates a [`Frame`] from a shot when it is accepted, fills
//! in the parameters it expects the hardware to apply, and the completion
//! handler overwrites those with the actual values reported by the driver.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::{Duration, Instant};

use super::image::Image;
use super::shot::Shot;
use super::statistics::{Histogram, SharpnessMap};

/// How far the reported parameters can be trusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Confidence(u8);

impl Confidence {
    pub const MATCH_REQUEST: Confidence = Confidence(1 << 0);
    /// Exposure was still settling when this frame was captured.
    pub const UNCERTAIN_EXPOSURE: Confidence = Confidence(1 << 1);
    pub const UNCERTAIN_GAIN: Confidence = Confidence(1 << 2);

    pub const fn empty() -> Self {
        Confidence(0)
    }

    pub const fn contains(self, other: Confidence) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Confidence) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Confidence) {
        self.0 &= !other.0;
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Confidence {
    type Output = Confidence;

    fn bitor(self, rhs: Self) -> Self {
        Confidence(self.0 | rhs.0)
    }
}

impl BitOrAssign for Confidence {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::Int(v)
    }
}

impl From<f32> for TagValue {
    fn from(v: f32) -> Self {
        TagValue::Float(v.into())
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        TagValue::Float(v)
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::Text(v.to_owned())
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Int(v) => write!(f, "{v}"),
            TagValue::Float(v) => write!(f, "{v}"),
            TagValue::Text(v) => f.write_str(v),
        }
    }
}

pub type Tags = BTreeMap<String, TagValue>;

#[derive(Debug, Clone)]
pub struct Frame {
    shot: Shot,
    pub image: Image,
    pub exposure: Duration,
    pub frame_time: Duration,
    pub gain: f32,
    pub white_balance: u32,
    pub exposure_start: Option<Instant>,
    pub exposure_end: Option<Instant>,
    pub processing_done: Option<Instant>,
    pub histogram: Option<Histogram>,
    pub sharpness: Option<SharpnessMap>,
    pub tags: Tags,
    pub confidence: Confidence,
}

impl Frame {
    /// Start tracking `shot`. Parameters begin as the requested ones and the
    /// image as a placeholder of the requested geometry.
    pub fn from_shot(shot: Shot) -> Self {
        Self {
            image: Image::placeholder(shot.image.size, shot.image.format),
            exposure: shot.exposure,
            frame_time: shot.frame_time,
            gain: shot.gain,
            white_balance: shot.white_balance,
            exposure_start: None,
            exposure_end: None,
            processing_done: None,
            histogram: None,
            sharpness: None,
            tags: Tags::new(),
            confidence: Confidence::empty(),
            shot,
        }
    }

    pub fn id(&self) -> u64 {
        self.shot.id()
    }

    pub fn wanted(&self) -> bool {
        self.shot.wanted
    }

    pub fn shot(&self) -> &Shot {
        &self.shot
    }

    pub(crate) fn shot_mut(&mut self) -> &mut Shot {
        &mut self.shot
    }

    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn get_tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }
}
