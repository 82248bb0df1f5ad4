//! Pre- and post-processing around the super-resolution network.
//!
//! The order of every stage below is part of the output contract.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use ndarray::{Array4, s};

use crate::imaging::{self, ImagingError, SHARPEN_KERNEL};

/// Sigma of the 3x3 denoising blur applied before inference.
pub const BLUR_SIGMA: f32 = 0.5;
/// Share of the sharpened image in the final blend.
pub const SHARPENED_WEIGHT: f32 = 0.8;
/// Share of the un-sharpened network output in the final blend.
pub const ORIGINAL_WEIGHT: f32 = 0.2;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("could not decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("could not encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("image of {width}x{height} is smaller than the scale factor {scale}")]
    TooSmall { width: u32, height: u32, scale: usize },
    #[error("expected network output shaped (1, H, W, 1), got {0:?}")]
    OutputShape(Vec<usize>),
    #[error(transparent)]
    Imaging(#[from] ImagingError),
}

/// Decodes any supported image and reduces it to 8-bit grayscale.
pub fn decode_gray(bytes: &[u8]) -> Result<GrayImage, PipelineError> {
    let image = image::load_from_memory(bytes).map_err(PipelineError::Decode)?;
    Ok(image.to_luma8())
}

/// Turns stored image bytes into a `(1, H', W', 1)` working tensor.
pub fn preprocess(bytes: &[u8], scale: usize) -> Result<Array4<f32>, PipelineError> {
    preprocess_gray(&decode_gray(bytes)?, scale)
}

/// Equalizes, denoises and normalizes `gray`, then crops trailing rows and
/// columns so both sides are multiples of `scale`.
pub fn preprocess_gray(gray: &GrayImage, scale: usize) -> Result<Array4<f32>, PipelineError> {
    let equalized = imaging::equalize_hist(gray);
    let blurred = imaging::gaussian_blur_3x3(&equalized, BLUR_SIGMA);

    let (width, height) = blurred.dimensions();
    let scale = scale.max(1);
    let crop_w = width as usize - width as usize % scale;
    let crop_h = height as usize - height as usize % scale;
    if crop_w == 0 || crop_h == 0 {
        return Err(PipelineError::TooSmall {
            width,
            height,
            scale,
        });
    }

    Ok(Array4::from_shape_fn((1, crop_h, crop_w, 1), |(_, y, x, _)| {
        f32::from(blurred.get_pixel(x as u32, y as u32)[0]) / 255.0
    }))
}

fn to_u8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Turns raw network output into the final 8-bit image: clip, quantize,
/// sharpen, blend 0.8/0.2 with the unsharpened image, then equalize.
pub fn postprocess(output: &Array4<f32>) -> Result<GrayImage, PipelineError> {
    let (batch, height, width, channels) = output.dim();
    if batch != 1 || channels != 1 {
        return Err(PipelineError::OutputShape(output.shape().to_vec()));
    }
    let (Ok(w), Ok(h)) = (u32::try_from(width), u32::try_from(height)) else {
        return Err(PipelineError::OutputShape(output.shape().to_vec()));
    };

    let plane = output.slice(s![0, .., .., 0]);
    let base = GrayImage::from_fn(w, h, |x, y| Luma([to_u8(plane[[y as usize, x as usize]])]));

    let sharpened = imaging::filter_3x3(&base, &SHARPEN_KERNEL);
    let blended = imaging::add_weighted(&sharpened, SHARPENED_WEIGHT, &base, ORIGINAL_WEIGHT)?;
    Ok(imaging::equalize_hist(&blended))
}

/// Picks the storage format from a file name, defaulting to PNG.
pub fn format_for(name: &str) -> ImageFormat {
    Path::new(name)
        .extension()
        .and_then(ImageFormat::from_extension)
        .unwrap_or(ImageFormat::Png)
}

/// Encodes a grayscale image in the format implied by `name`.
pub fn encode(image: GrayImage, name: &str) -> Result<Vec<u8>, PipelineError> {
    let format = format_for(name);
    let image = match format {
        // the gif encoder only takes rgba frames
        ImageFormat::Gif => DynamicImage::ImageRgba8(DynamicImage::ImageLuma8(image).to_rgba8()),
        _ => DynamicImage::ImageLuma8(image),
    };

    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, format)
        .map_err(PipelineError::Encode)?;
    Ok(buffer.into_inner())
}
