//! 8-bit grayscale filters used around inference.
//!
//! Borders are handled by reflect-101 mirroring (`dcb|abcd|cba`), and results are
//! rounded and saturated to `[0, 255]` unless stated otherwise.

use image::{GrayImage, Luma};

#[derive(Debug, thiserror::Error)]
pub enum ImagingError {
    #[error("images differ in size: {left:?} vs {right:?}")]
    DimensionMismatch { left: (u32, u32), right: (u32, u32) },
}

/// 3x3 kernel that boosts each pixel against its eight neighbours.
pub const SHARPEN_KERNEL: [[f32; 3]; 3] = [[-1.0, -1.0, -1.0], [-1.0, 9.0, -1.0], [-1.0, -1.0, -1.0]];

fn saturate(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn reflect_101(index: i64, len: u32) -> u32 {
    let len = i64::from(len);
    if len == 1 {
        return 0;
    }
    let mut i = index;
    while i < 0 || i >= len {
        i = if i < 0 { -i } else { 2 * (len - 1) - i };
    }
    i as u32
}

/// Spreads the intensity histogram over the full 8-bit range.
///
/// The lookup table is the cumulative histogram counted from the first
/// occupied bin, scaled by `255 / (total - hist[first])`. A single-valued
/// image is returned unchanged.
pub fn equalize_hist(img: &GrayImage) -> GrayImage {
    let mut hist = [0usize; 256];
    for &p in img.as_raw() {
        hist[p as usize] += 1;
    }

    let total = img.as_raw().len();
    let Some(first) = hist.iter().position(|&n| n > 0) else {
        return img.clone();
    };
    if hist[first] == total {
        return img.clone();
    }

    let scale = 255.0 / (total - hist[first]) as f32;
    let mut lut = [0u8; 256];
    let mut sum = 0usize;
    for value in first + 1..256 {
        sum += hist[value];
        lut[value] = saturate(sum as f32 * scale);
    }

    let mut out = img.clone();
    for p in out.iter_mut() {
        *p = lut[*p as usize];
    }
    out
}

/// Separable 3x3 gaussian blur.
pub fn gaussian_blur_3x3(img: &GrayImage, sigma: f32) -> GrayImage {
    let side = (-1.0 / (2.0 * sigma * sigma)).exp();
    let norm = 1.0 + 2.0 * side;
    let taps = [side / norm, 1.0 / norm, side / norm];

    let (width, height) = img.dimensions();
    let mut rows = vec![0.0f32; (width * height) as usize];
    for y in 0..height {
        for x in 0..width {
            let acc: f32 = (-1i64..=1)
                .zip(taps)
                .map(|(dx, t)| {
                    let sx = reflect_101(i64::from(x) + dx, width);
                    t * f32::from(img.get_pixel(sx, y)[0])
                })
                .sum();
            rows[(y * width + x) as usize] = acc;
        }
    }

    GrayImage::from_fn(width, height, |x, y| {
        let acc: f32 = (-1i64..=1)
            .zip(taps)
            .map(|(dy, t)| {
                let sy = reflect_101(i64::from(y) + dy, height);
                t * rows[(sy * width + x) as usize]
            })
            .sum();
        Luma([saturate(acc)])
    })
}

/// Correlates the image with a 3x3 kernel.
pub fn filter_3x3(img: &GrayImage, kernel: &[[f32; 3]; 3]) -> GrayImage {
    let (width, height) = img.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let mut acc = 0.0f32;
        for (ky, row) in kernel.iter().enumerate() {
            let sy = reflect_101(i64::from(y) + ky as i64 - 1, height);
            for (kx, weight) in row.iter().enumerate() {
                let sx = reflect_101(i64::from(x) + kx as i64 - 1, width);
                acc += weight * f32::from(img.get_pixel(sx, sy)[0]);
            }
        }
        Luma([saturate(acc)])
    })
}

/// `a * alpha + b * beta`, truncated towards zero and saturated to 8 bits.
pub fn add_weighted(
    a: &GrayImage,
    alpha: f32,
    b: &GrayImage,
    beta: f32,
) -> Result<GrayImage, ImagingError> {
    if a.dimensions() != b.dimensions() {
        return Err(ImagingError::DimensionMismatch {
            left: a.dimensions(),
            right: b.dimensions(),
        });
    }

    let mut out = a.clone();
    for (o, &pb) in out.iter_mut().zip(b.as_raw()) {
        *o = (f32::from(*o) * alpha + f32::from(pb) * beta).clamp(0.0, 255.0) as u8;
    }
    Ok(out)
}
