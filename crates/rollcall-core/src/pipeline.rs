//! Detector + embedding model bundle shared by enrollment and recognition.

use crate::detector::{DetectorError, FaceDetector};
use crate::preprocess::{self, PreprocessError};
use crate::recognizer::{EmbeddingModel, RecognizerError};
use crate::types::{Embedding, EmbeddingError, FaceDetection};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// Owns the two inference contexts. Callers hold it behind one lock.
pub struct Inference {
    detector: Box<dyn FaceDetector>,
    model: Box<dyn EmbeddingModel>,
}

impl Inference {
    pub fn new(detector: Box<dyn FaceDetector>, model: Box<dyn EmbeddingModel>) -> Self {
        Self { detector, model }
    }

    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, PipelineError> {
        Ok(self.detector.detect(image)?)
    }

    /// Preprocess, embed and L2-normalize one detected face.
    pub fn embed_face(&mut self, image: &RgbImage, face: &FaceDetection) -> Result<Embedding, PipelineError> {
        let tensor = preprocess::preprocess(image, face)?;
        let raw = self.model.embed(&tensor)?;
        Ok(Embedding::from_raw(raw)?)
    }

    pub fn embedding_dimension(&self) -> usize {
        self.model.dimension()
    }
}

/// Highest-confidence detection; the first one wins a tie.
pub fn best_detection(faces: &[FaceDetection]) -> Option<&FaceDetection> {
    faces.iter().fold(None, |best: Option<&FaceDetection>, f| match best {
        Some(b) if b.confidence >= f.confidence => Some(b),
        _ => Some(f),
    })
}
