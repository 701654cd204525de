use image::RgbImage;
use tracing::trace;

use crate::geometry::{BBox, PixelRect};

const CHANNELS: usize = 3;
const MIN_KERNEL: u32 = 3;
const BOX_PASSES: usize = 3;

/// Longest kernel convolved tap by tap.
pub const DIRECT_KERNEL_MAX: u32 = 31;

/// Returns a copy of `image` with every box blurred in place.
///
/// Boxes are clamped to the image first; anything left without area is
/// skipped. Boxes are applied in order, so overlapping regions are blurred
/// more than once.
pub fn redact(image: &RgbImage, boxes: &[BBox]) -> RgbImage {
    let mut output = image.clone();
    let (width, height) = output.dimensions();

    for bbox in boxes {
        match bbox.clamp_to(width, height) {
            Some(rect) => blur_region(&mut output, rect),
            None => trace!(?bbox, "box outside image, skipped"),
        }
    }

    output
}

/// Odd kernel extent proportional to the region extent, at least 3.
pub fn kernel_size(extent: u32) -> u32 {
    ((extent / 3) | 1).max(MIN_KERNEL)
}

/// Gaussian-blurs exactly `rect` of `image`. Pixels outside `rect` are
/// neither read nor written; the region border is reflected (reflect-101).
///
/// Kernels up to [`DIRECT_KERNEL_MAX`] taps are applied directly. Longer ones
/// run as a three-pass box cascade of the same sigma, so the cost per pixel
/// does not grow with the region.
pub fn blur_region(image: &mut RgbImage, rect: PixelRect) {
    let w = rect.width as usize;
    let h = rect.height as usize;

    let mut region = Vec::with_capacity(w * h * CHANNELS);
    for ry in 0..rect.height {
        for rx in 0..rect.width {
            let p = image.get_pixel(rect.x + rx, rect.y + ry);
            region.extend(p.0.iter().map(|&v| f32::from(v)));
        }
    }

    let horizontal = blur_axis(&region, w, h, kernel_size(rect.width), Axis::Horizontal);
    let blurred = blur_axis(&horizontal, w, h, kernel_size(rect.height), Axis::Vertical);

    for ry in 0..rect.height {
        for rx in 0..rect.width {
            let idx = (ry as usize * w + rx as usize) * CHANNELS;
            let p = image.get_pixel_mut(rect.x + rx, rect.y + ry);
            for (dst, &v) in p.0.iter_mut().zip(&blurred[idx..idx + CHANNELS]) {
                *dst = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Axis {
    Horizontal,
    Vertical,
}

impl Axis {
    /// `(line count, line length)` of a `w` x `h` buffer along this axis.
    fn lines(self, w: usize, h: usize) -> (usize, usize) {
        match self {
            Axis::Horizontal => (h, w),
            Axis::Vertical => (w, h),
        }
    }

    /// Buffer offset of sample `i` on `line`.
    fn offset(self, w: usize, line: usize, i: usize) -> usize {
        match self {
            Axis::Horizontal => (line * w + i) * CHANNELS,
            Axis::Vertical => (i * w + line) * CHANNELS,
        }
    }
}

fn blur_axis(src: &[f32], w: usize, h: usize, kernel: u32, axis: Axis) -> Vec<f32> {
    if kernel <= DIRECT_KERNEL_MAX {
        return convolve(src, w, h, &gaussian_kernel(kernel), axis);
    }

    let mut out = src.to_vec();
    for size in box_sizes(gaussian_sigma(kernel)) {
        out = box_pass(&out, w, h, size, axis);
    }
    out
}

fn convolve(src: &[f32], w: usize, h: usize, kernel: &[f32], axis: Axis) -> Vec<f32> {
    let (lines, len) = axis.lines(w, h);
    let radius = (kernel.len() / 2) as isize;
    let mut dst = vec![0f32; src.len()];

    for line in 0..lines {
        for i in 0..len {
            let mut acc = [0f32; CHANNELS];
            for (k, weight) in kernel.iter().enumerate() {
                let j = reflect_101(i as isize + k as isize - radius, len);
                let idx = axis.offset(w, line, j);
                for (a, &v) in acc.iter_mut().zip(&src[idx..idx + CHANNELS]) {
                    *a += v * weight;
                }
            }
            let out = axis.offset(w, line, i);
            dst[out..out + CHANNELS].copy_from_slice(&acc);
        }
    }

    dst
}

/// Moving average of odd width `size` along `axis`, O(1) per sample.
fn box_pass(src: &[f32], w: usize, h: usize, size: usize, axis: Axis) -> Vec<f32> {
    let (lines, len) = axis.lines(w, h);
    let radius = (size / 2) as isize;
    let scale = 1.0 / size as f32;
    let mut dst = vec![0f32; src.len()];

    for line in 0..lines {
        let mut acc = [0f32; CHANNELS];
        for d in -radius..=radius {
            let idx = axis.offset(w, line, reflect_101(d, len));
            for (a, &v) in acc.iter_mut().zip(&src[idx..idx + CHANNELS]) {
                *a += v;
            }
        }

        for i in 0..len {
            let out = axis.offset(w, line, i);
            for (d, &a) in dst[out..out + CHANNELS].iter_mut().zip(&acc) {
                *d = a * scale;
            }

            let enter = axis.offset(w, line, reflect_101(i as isize + radius + 1, len));
            let leave = axis.offset(w, line, reflect_101(i as isize - radius, len));
            let entering = &src[enter..enter + CHANNELS];
            let leaving = &src[leave..leave + CHANNELS];
            for ((a, &e), &l) in acc.iter_mut().zip(entering).zip(leaving) {
                *a += e - l;
            }
        }
    }

    dst
}

/// Odd box widths whose cascade has the variance of a Gaussian of `sigma`.
fn box_sizes(sigma: f64) -> [usize; BOX_PASSES] {
    let n = BOX_PASSES as f64;
    let ideal = (12.0 * sigma * sigma / n + 1.0).sqrt();
    let mut lower = ideal.floor() as i64;
    if lower % 2 == 0 {
        lower -= 1;
    }
    let lower = lower.max(1);
    let upper = lower + 2;

    let lf = lower as f64;
    let m_ideal = (12.0 * sigma * sigma - n * lf * lf - 4.0 * n * lf - 3.0 * n) / (-4.0 * lf - 4.0);
    let m = m_ideal.round().clamp(0.0, n) as usize;

    let mut sizes = [upper as usize; BOX_PASSES];
    for size in sizes.iter_mut().take(m) {
        *size = lower as usize;
    }
    sizes
}

fn gaussian_sigma(size: u32) -> f64 {
    0.3 * ((f64::from(size) - 1.0) * 0.5 - 1.0) + 0.8
}

/// Normalized 1-D Gaussian of odd length `size`, sigma derived from the size.
fn gaussian_kernel(size: u32) -> Vec<f32> {
    let sigma = gaussian_sigma(size);
    let center = (size as f64 - 1.0) / 2.0;
    let denom = 2.0 * sigma * sigma;

    let weights: Vec<f64> = (0..size)
        .map(|i| {
            let d = i as f64 - center;
            (-(d * d) / denom).exp()
        })
        .collect();
    let sum: f64 = weights.iter().sum();

    weights.into_iter().map(|w| (w / sum) as f32).collect()
}

/// Mirror index into `0..n` without repeating the edge sample.
fn reflect_101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let m = i.rem_euclid(period);
    if m >= n as isize {
        (period - m) as usize
    } else {
        m as usize
    }
}
