//! Sharpness and histogram evaluators run on completed frames
//!
//! Both subsample the image so that no more than a fixed number of samples
//! feed an accumulator.

use super::image::{Image, PixelFormat, Rect, Size};
use super::shot::{HistogramConfig, SharpnessConfig};

pub const MAX_VARIANCE_SAMPLES: usize = 32_768;
pub const MAX_HISTOGRAM_SAMPLES: usize = 32_768;

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    buckets: usize,
    channels: usize,
    region: Rect,
    data: Vec<u32>,
}

impl Histogram {
    fn new(buckets: usize, channels: usize, region: Rect) -> Self {
        Self {
            buckets,
            channels,
            region,
            data: vec![0; buckets * channels],
        }
    }

    pub fn buckets(&self) -> usize {
        self.buckets
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn region(&self) -> Rect {
        self.region
    }

    pub fn get(&self, bucket: usize, channel: usize) -> u32 {
        self.data[channel * self.buckets + bucket]
    }

    /// Samples counted in one channel.
    pub fn total(&self, channel: usize) -> u64 {
        let start = channel * self.buckets;
        self.data[start..start + self.buckets]
            .iter()
            .map(|&n| u64::from(n))
            .sum()
    }

    fn bump(&mut self, bucket: usize, channel: usize) {
        self.data[channel * self.buckets + bucket] += 1;
    }
}

/// Per-cell intensity variance.
#[derive(Debug, Clone, PartialEq)]
pub struct SharpnessMap {
    size: Size,
    data: Vec<u32>,
}

impl SharpnessMap {
    pub fn size(&self) -> Size {
        self.size
    }

    pub fn get(&self, x: u32, y: u32) -> u32 {
        self.data[(y * self.size.width + x) as usize]
    }
}

/// Read access to one pixel's intensity channels.
struct Sampler<'a> {
    data: &'a [u8],
    bytes_per_row: usize,
    size: Size,
    format: PixelFormat,
}

impl Sampler<'_> {
    fn luma(&self, x: usize, y: usize) -> u32 {
        let row = y * self.bytes_per_row;
        match self.format {
            PixelFormat::Yuv420p => self.byte(row + x),
            PixelFormat::Rgb24 => {
                let p = row + x * 3;
                (self.byte(p) + 2 * self.byte(p + 1) + self.byte(p + 2)) / 4
            }
            // Little-endian 16-bit samples; keep the high byte.
            PixelFormat::Raw => self.byte(row + x * 2 + 1),
            PixelFormat::Unknown => 0,
        }
    }

    fn channel(&self, x: usize, y: usize, channel: usize) -> u32 {
        match (self.format, channel) {
            (PixelFormat::Yuv420p, 1 | 2) => {
                let height = self.size.height as usize;
                let chroma_stride = self.bytes_per_row / 2;
                let mut plane = height * self.bytes_per_row;
                if channel == 2 {
                    plane += (height / 2) * chroma_stride;
                }
                self.byte(plane + (y / 2) * chroma_stride + x / 2)
            }
            (PixelFormat::Rgb24, c) => self.byte(y * self.bytes_per_row + x * 3 + c),
            _ => self.luma(x, y),
        }
    }

    fn byte(&self, index: usize) -> u32 {
        self.data.get(index).copied().map_or(0, u32::from)
    }
}

fn channels_for(format: PixelFormat) -> usize {
    match format {
        PixelFormat::Yuv420p | PixelFormat::Rgb24 => 3,
        PixelFormat::Raw | PixelFormat::Unknown => 1,
    }
}

/// Smallest power-of-two stride keeping `width * height / stride²` under `cap`.
fn subsample_for(mut width: usize, mut height: usize, mut subsample: usize, cap: usize) -> usize {
    while width * height > cap {
        width >>= 1;
        height >>= 1;
        subsample <<= 1;
    }
    subsample
}

fn clip(region: Rect, size: Size) -> Rect {
    if region.width == 0 || region.height == 0 {
        return Rect::covering(size);
    }
    let x = region.x.min(size.width);
    let y = region.y.min(size.height);
    Rect::new(
        x,
        y,
        region.width.min(size.width - x),
        region.height.min(size.height - y),
    )
}

pub fn evaluate_variance(config: &SharpnessConfig, image: &Image) -> Option<SharpnessMap> {
    if !config.enabled || !image.valid() {
        return None;
    }
    let cells = Size::new(config.size.width.max(1), config.size.height.max(1));
    let size = image.size();
    let subsample = subsample_for(size.width as usize, size.height as usize, 1, MAX_VARIANCE_SAMPLES);

    image.with_pixels(|data| {
        let sampler = Sampler {
            data,
            bytes_per_row: image.bytes_per_row(),
            size,
            format: image.format(),
        };
        let cell_w = (size.width / cells.width).max(1) as usize;
        let cell_h = (size.height / cells.height).max(1) as usize;

        let mut map = SharpnessMap {
            size: cells,
            data: Vec::with_capacity(cells.area()),
        };
        for cy in 0..cells.height as usize {
            for cx in 0..cells.width as usize {
                let (mut sum, mut sum_sq, mut samples) = (0u64, 0u64, 0u64);
                let y_end = ((cy + 1) * cell_h).min(size.height as usize);
                let x_end = ((cx + 1) * cell_w).min(size.width as usize);
                for y in (cy * cell_h..y_end).step_by(subsample) {
                    for x in (cx * cell_w..x_end).step_by(subsample) {
                        let v = u64::from(sampler.luma(x, y));
                        sum += v;
                        sum_sq += v * v;
                        samples += 1;
                    }
                }
                let variance = if samples == 0 {
                    0
                } else {
                    let mean = sum / samples;
                    (sum_sq / samples).saturating_sub(mean * mean)
                };
                map.data.push(variance as u32);
            }
        }
        map
    })
}

pub fn evaluate_histogram(config: &HistogramConfig, image: &Image) -> Option<Histogram> {
    if !config.enabled || !image.valid() {
        return None;
    }

    // Largest power of two not above the request, capped at one per level.
    let mut buckets = 1usize;
    let mut requested = config.buckets.clamp(1, 256);
    while requested > 1 {
        buckets <<= 1;
        requested >>= 1;
    }
    let shift = 8 - buckets.trailing_zeros();

    let region = clip(config.region, image.size());
    let format = image.format();
    let initial = if format == PixelFormat::Yuv420p { 2 } else { 1 };
    let subsample = subsample_for(
        region.width as usize / initial,
        region.height as usize / initial,
        initial,
        MAX_HISTOGRAM_SAMPLES,
    );
    let channels = channels_for(format);

    image.with_pixels(|data| {
        let sampler = Sampler {
            data,
            bytes_per_row: image.bytes_per_row(),
            size: image.size(),
            format,
        };
        let mut histogram = Histogram::new(buckets, channels, region);
        let xs = region.x as usize..(region.x + region.width) as usize;
        let ys = region.y as usize..(region.y + region.height) as usize;
        for y in ys.step_by(subsample) {
            for x in xs.clone().step_by(subsample) {
                for channel in 0..channels {
                    let bucket = (sampler.channel(x, y, channel) >> shift) as usize;
                    histogram.bump(bucket, channel);
                }
            }
        }
        histogram
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn yuv(size: Size, luma: impl Fn(usize, usize) -> u8) -> Image {
        let w = size.width as usize;
        let h = size.height as usize;
        let mut data = vec![128u8; w * (h + h / 2)];
        for y in 0..h {
            for x in 0..w {
                data[y * w + x] = luma(x, y);
            }
        }
        Image::from_bytes(size, PixelFormat::Yuv420p, Bytes::from(data), None).unwrap()
    }

    #[test]
    fn flat_image_has_no_variance() {
        let image = yuv(Size::new(64, 32), |_, _| 77);
        let config = SharpnessConfig {
            enabled: true,
            size: Size::new(2, 2),
        };
        let map = evaluate_variance(&config, &image).unwrap();
        assert_eq!(map.size(), Size::new(2, 2));
        assert!((0..2).all(|y| (0..2).all(|x| map.get(x, y) == 0)));
    }

    #[test]
    fn stripes_have_variance() {
        let image = yuv(Size::new(64, 32), |x, _| if x % 2 == 0 { 0 } else { 200 });
        let config = SharpnessConfig {
            enabled: true,
            size: Size::new(1, 1),
        };
        assert!(evaluate_variance(&config, &image).unwrap().get(0, 0) > 0);
    }

    #[test]
    fn disabled_or_empty_images_skip_evaluation() {
        let image = yuv(Size::new(8, 8), |_, _| 1);
        assert!(evaluate_variance(&SharpnessConfig::default(), &image).is_none());
        let enabled = HistogramConfig {
            enabled: true,
            ..Default::default()
        };
        let placeholder = Image::placeholder(Size::new(8, 8), PixelFormat::Yuv420p);
        assert!(evaluate_histogram(&enabled, &placeholder).is_none());
    }

    #[test]
    fn histogram_buckets_round_down_to_power_of_two() {
        let image = yuv(Size::new(32, 32), |_, _| 255);
        let config = HistogramConfig {
            enabled: true,
            region: Rect::default(),
            buckets: 48,
        };
        let histogram = evaluate_histogram(&config, &image).unwrap();
        assert_eq!(histogram.buckets(), 32);
        assert_eq!(histogram.channels(), 3);
        // 32x32 sampled every other pixel
        assert_eq!(histogram.total(0), 256);
        assert_eq!(histogram.get(31, 0), 256);
        // Neutral chroma lands mid-range.
        assert_eq!(histogram.get(16, 1), 256);
    }

    #[test]
    fn large_images_are_subsampled_under_the_cap() {
        let image = Image::new(Size::new(1024, 768), PixelFormat::Rgb24);
        let config = HistogramConfig {
            enabled: true,
            region: Rect::default(),
            buckets: 16,
        };
        let histogram = evaluate_histogram(&config, &image).unwrap();
        assert!(histogram.total(0) <= MAX_HISTOGRAM_SAMPLES as u64);
        assert_eq!(histogram.total(0), u64::from(histogram.get(0, 0)));
    }
}
