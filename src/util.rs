use std::path::Path;

use image::{imageops, DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use ndarray::{Array3, ArrayView2, Axis};
use ort::{GraphOptimizationLevel, Session};
use tracing::instrument;

use crate::{OcrError, Result};

/// Builds an inference session for one of the three models. The returned
/// session owns the model and releases it when dropped.
#[instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
pub(crate) fn create_session(path: impl AsRef<Path>, num_threads: usize) -> Result<(Session, String)> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_parallel_execution(true)?
        .with_inter_threads(num_threads)?
        .with_intra_threads(num_threads)?
        .commit_from_file(path.as_ref())?;

    log::debug!("Session inputs: {:?}", session.inputs);
    log::debug!("Session outputs: {:?}", session.outputs);

    let input_name = session
        .inputs
        .first()
        .map(|input| input.name.clone())
        .ok_or_else(|| OcrError::UnexpectedOutput("model declares no inputs".to_string()))?;
    Ok((session, input_name))
}

/// Converts an image into a CHW tensor where each channel value becomes
/// `value * norm - mean * norm`, with `value` in `[0, 1]`.
#[instrument(level = "trace", skip(image))]
pub(crate) fn subtract_mean_normalize(
    image: &DynamicImage,
    mean_vals: &[f32; 3],
    norm_vals: &[f32; 3],
) -> Array3<f32> {
    let image = image.to_rgb32f();
    let (width, height) = image.dimensions();
    let mut tensor = Array3::<f32>::zeros((3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for ch in 0..3 {
            tensor[[ch, y as usize, x as usize]] =
                pixel.0[ch] * norm_vals[ch] - mean_vals[ch] * norm_vals[ch];
        }
    }
    tensor
}

/// Surrounds the image with a white border of `padding` pixels.
pub fn make_padding(image: &DynamicImage, padding: u32) -> Result<DynamicImage> {
    if padding == 0 {
        return Ok(image.clone());
    }
    let too_large = || OcrError::ImageTooLarge {
        width: image.width(),
        height: image.height(),
    };
    let border = padding.checked_mul(2).ok_or_else(too_large)?;
    let width = image.width().checked_add(border).ok_or_else(too_large)?;
    let height = image.height().checked_add(border).ok_or_else(too_large)?;

    let mut canvas = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    imageops::replace(&mut canvas, &image.to_rgb8(), padding as i64, padding as i64);
    Ok(DynamicImage::ImageRgb8(canvas))
}

/// Scales a probability map to an 8-bit image, rounding to the nearest level.
pub(crate) fn to_luma_image(data: ArrayView2<f32>) -> GrayImage {
    let height = data.len_of(Axis(0));
    let width = data.len_of(Axis(1));
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let value = data[[y as usize, x as usize]] * 255.0;
        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

/// Mapping between the source image and the detector input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleParam {
    pub src_width: u32,
    pub src_height: u32,
    pub dst_width: u32,
    pub dst_height: u32,
    /// `dst_width / src_width`
    pub scale_x: f32,
    /// `dst_height / src_height`
    pub scale_y: f32,
}

fn floor_to_multiple_of_32(value: u32) -> u32 {
    (value / 32 * 32).max(32)
}

impl ScaleParam {
    /// Scales the longer side to `dst_size` and the other proportionally,
    /// then floors both to a multiple of 32 (at least 32).
    pub fn new(src_width: u32, src_height: u32, dst_size: u32) -> Self {
        let (mut dst_width, mut dst_height) = if src_width > src_height {
            let scale = dst_size as f32 / src_width.max(1) as f32;
            (dst_size, (src_height as f32 * scale) as u32)
        } else {
            let scale = dst_size as f32 / src_height.max(1) as f32;
            ((src_width as f32 * scale) as u32, dst_size)
        };

        if dst_width % 32 != 0 || dst_width == 0 {
            let floored = floor_to_multiple_of_32(dst_width);
            log::debug!("Target width of {dst_width} wasn't a multiple of 32, flooring to {floored}.");
            dst_width = floored;
        }
        if dst_height % 32 != 0 || dst_height == 0 {
            let floored = floor_to_multiple_of_32(dst_height);
            log::debug!("Target height of {dst_height} wasn't a multiple of 32, flooring to {floored}.");
            dst_height = floored;
        }

        let scale_x = dst_width as f32 / src_width.max(1) as f32;
        let scale_y = dst_height as f32 / src_height.max(1) as f32;
        log::debug!(
            "Resize will change image dimensions from (w: {src_width}, h: {src_height}) to (w: {dst_width}, h: {dst_height}) with scaling factor ({scale_x}, {scale_y})."
        );

        Self {
            src_width,
            src_height,
            dst_width,
            dst_height,
            scale_x,
            scale_y,
        }
    }
}
