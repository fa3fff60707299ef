//! Face canonicalization for the FaceNet embedding model.
//!
//! Crop with a margin, bicubic resize to 160×160, scale to [0, 1] and
//! prewhiten. The whitening matches what FaceNet was trained with and is
//! part of the model contract, not a tunable.

use crate::types::FaceDetection;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use thiserror::Error;

/// Side length of the canonical face crop.
pub const FACE_SIZE: usize = 160;
/// Margin added on each side, as a fraction of the shorter box side.
pub const MARGIN_FRACTION: f32 = 0.2;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreprocessError {
    #[error("face box {x},{y} {width}x{height} lies outside the {image_width}x{image_height} image")]
    EmptyCrop {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        image_width: u32,
        image_height: u32,
    },
}

/// A preprocessed face, NHWC `[1, 160, 160, 3]`.
#[derive(Debug, Clone)]
pub struct FaceTensor(Array4<f32>);

impl FaceTensor {
    pub fn as_array(&self) -> &Array4<f32> {
        &self.0
    }
}

/// Pixel rectangle `(x, y, width, height)` cut from the image for a detection.
pub fn crop_region(image_width: u32, image_height: u32, detection: &FaceDetection) -> Option<(u32, u32, u32, u32)> {
    let b = &detection.bbox;
    let x = b.x.max(0.0).floor() as u32;
    let y = b.y.max(0.0).floor() as u32;
    let w = b.width.max(0.0).round() as u32;
    let h = b.height.max(0.0).round() as u32;
    let margin = (w.min(h) as f32 * MARGIN_FRACTION) as u32;

    let x_min = x.saturating_sub(margin);
    let y_min = y.saturating_sub(margin);
    let x_max = image_width.min(x.saturating_add(w).saturating_add(margin));
    let y_max = image_height.min(y.saturating_add(h).saturating_add(margin));

    (x_max > x_min && y_max > y_min).then(|| (x_min, y_min, x_max - x_min, y_max - y_min))
}

/// Crop, resize and whiten one detected face.
pub fn preprocess(image: &RgbImage, detection: &FaceDetection) -> Result<FaceTensor, PreprocessError> {
    let (x, y, w, h) = crop_region(image.width(), image.height(), detection).ok_or(
        PreprocessError::EmptyCrop {
            x: detection.bbox.x,
            y: detection.bbox.y,
            width: detection.bbox.width,
            height: detection.bbox.height,
            image_width: image.width(),
            image_height: image.height(),
        },
    )?;

    let crop = imageops::crop_imm(image, x, y, w, h).to_image();
    let resized = imageops::resize(&crop, FACE_SIZE as u32, FACE_SIZE as u32, FilterType::CatmullRom);

    let mut values: Vec<f32> = resized.as_raw().iter().map(|&p| p as f32 / 255.0).collect();
    prewhiten(&mut values);

    // RgbImage is row-major interleaved, which is NHWC for N = 1.
    let tensor = Array4::from_shape_fn((1, FACE_SIZE, FACE_SIZE, 3), |(_, y, x, c)| {
        values[(y * FACE_SIZE + x) * 3 + c]
    });
    Ok(FaceTensor(tensor))
}

/// `(v - mean) / max(std, 1/sqrt(n))` over the whole buffer.
///
/// The floor keeps near-constant crops (e.g. all black) finite.
pub fn prewhiten(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    let std_adj = var.sqrt().max(1.0 / n.sqrt());
    for v in values.iter_mut() {
        *v = ((*v as f64 - mean) / std_adj) as f32;
    }
}
