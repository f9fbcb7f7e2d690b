pub mod action;
pub mod convert;
pub mod frame;
pub mod image;
pub mod shot;
pub mod statistics;

pub use action::{Action, ActionPayload};
pub use frame::{Confidence, Frame, TagValue, Tags};
pub use image::{Image, ImageGuard, PixelFormat, Rect, Size};
pub use shot::{Allocation, HistogramConfig, ImageTarget, SharpnessConfig, Shot, ShotIds};
