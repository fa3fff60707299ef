//! Fake detector and model for exercising the pipeline without ONNX models.

use crate::detector::{DetectorError, FaceDetector};
use crate::input::{ChannelOrder, ImageInput};
use crate::preprocess::{FaceTensor, FACE_SIZE};
use crate::recognizer::{EmbeddingModel, RecognizerError};
use crate::types::{BoundingBox, FaceDetection};
use image::RgbImage;

pub(crate) const IMAGE_SIZE: u32 = 32;

/// Detector whose answer is computed from the decoded image.
pub(crate) struct FnDetector<F>(pub F);

impl<F> FaceDetector for FnDetector<F>
where
    F: FnMut(&RgbImage) -> Vec<FaceDetection> + Send,
{
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError> {
        Ok((self.0)(image))
    }
}

/// Returns the whitened channels of the crop's center pixel.
///
/// Solid-color crops with different channel balance map to different
/// directions, which is enough to tell test identities apart.
pub(crate) struct CenterPixelModel;

impl EmbeddingModel for CenterPixelModel {
    fn embed(&mut self, face: &FaceTensor) -> Result<Vec<f32>, RecognizerError> {
        let t = face.as_array();
        let c = FACE_SIZE / 2;
        Ok((0..3).map(|ch| t[[0, c, c, ch]]).collect())
    }

    fn dimension(&self) -> usize {
        3
    }
}

pub(crate) fn face_at(x: f32, y: f32, size: f32, confidence: f32) -> FaceDetection {
    FaceDetection {
        bbox: BoundingBox { x, y, width: size, height: size },
        confidence,
        landmarks: None,
    }
}

/// A solid square image.
pub(crate) fn solid(rgb: [u8; 3]) -> ImageInput {
    ImageInput::Pixels {
        data: rgb.repeat((IMAGE_SIZE * IMAGE_SIZE) as usize),
        width: IMAGE_SIZE,
        height: IMAGE_SIZE,
        order: ChannelOrder::Rgb,
    }
}

/// One centered face in every non-black image. A green channel of exactly 1
/// marks a low-confidence (0.5) detection.
pub(crate) fn color_detector() -> FnDetector<impl FnMut(&RgbImage) -> Vec<FaceDetection> + Send> {
    FnDetector(|img: &RgbImage| {
        let px = img.get_pixel(img.width() / 2, img.height() / 2).0;
        if px == [0, 0, 0] {
            return Vec::new();
        }
        let confidence = if px[1] == 1 { 0.5 } else { 0.99 };
        vec![face_at(4.0, 4.0, 24.0, confidence)]
    })
}
