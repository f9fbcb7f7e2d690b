//! Pixel format conversion for auto-allocated and fixed targets

use std::time::Instant;

use super::image::{Image, PixelFormat};

/// Whether `convert_into` can produce `to` from `from`.
pub fn can_convert(from: PixelFormat, to: PixelFormat) -> bool {
    from == to || matches!((from, to), (PixelFormat::Yuv420p, PixelFormat::Rgb24))
}

/// Allocate a new image of `format` holding `src`'s pixels.
pub fn convert(src: &Image, format: PixelFormat) -> Option<Image> {
    let dst = Image::new(src.size(), format);
    convert_into(src, &dst).then_some(dst)
}

/// Write `src` into `dst`, converting formats. Clips to the smaller image.
/// Returns `false` for unsupported conversions or missing pixels.
pub fn convert_into(src: &Image, dst: &Image) -> bool {
    if !src.valid() || !dst.valid() {
        return false;
    }
    match (src.format(), dst.format()) {
        (a, b) if a == b => {
            dst.copy_from(src);
            true
        }
        (PixelFormat::Yuv420p, PixelFormat::Rgb24) => {
            let start = Instant::now();
            let done = yuv420p_to_rgb24(src, dst);
            metrics::histogram!("sensord.convert_time_us")
                .record(start.elapsed().as_micros() as f64);
            done
        }
        _ => false,
    }
}

fn yuv420p_to_rgb24(src: &Image, dst: &Image) -> bool {
    let width = src.width().min(dst.width()) as usize;
    let height = src.height().min(dst.height()) as usize;
    let src_height = src.height() as usize;
    let src_stride = src.bytes_per_row();
    let chroma_stride = src_stride / 2;
    let u_plane = src_height * src_stride;
    let v_plane = u_plane + (src_height / 2) * chroma_stride;
    let dst_stride = dst.bytes_per_row();

    src.with_pixels(|yuv| {
        dst.with_pixels_mut(|rgb| {
            for y in 0..height {
                for x in 0..width {
                    let chroma = (y / 2) * chroma_stride + x / 2;
                    let (Some(&luma), Some(&u), Some(&v)) = (
                        yuv.get(y * src_stride + x),
                        yuv.get(u_plane + chroma),
                        yuv.get(v_plane + chroma),
                    ) else {
                        return false;
                    };
                    let out = y * dst_stride + x * 3;
                    if out + 3 > rgb.len() {
                        return false;
                    }
                    rgb[out..out + 3].copy_from_slice(&bt601(luma, u, v));
                }
            }
            true
        })
        .unwrap_or(false)
    })
    .unwrap_or(false)
}

/// BT.601 studio-swing YCbCr to RGB, fixed point.
fn bt601(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}
