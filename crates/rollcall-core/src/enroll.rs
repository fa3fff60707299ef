//! Enrollment: many images of one person in, one averaged embedding out.

use crate::input::{ImageError, ImageInput};
use crate::pipeline::{best_detection, Inference, PipelineError};
use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default minimum detection confidence for bulk enrollment.
pub const DEFAULT_ENROLL_CONFIDENCE_FLOOR: f32 = 0.9;

/// How picky enrollment is about detection confidence.
///
/// Photos a person has just supplied are trusted as-is; photo sets gathered
/// for re-enrollment drop weak detections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Strictness {
    Interactive,
    Bulk { confidence_floor: f32 },
}

impl Strictness {
    pub fn bulk() -> Self {
        Strictness::Bulk {
            confidence_floor: DEFAULT_ENROLL_CONFIDENCE_FLOOR,
        }
    }

    fn accepts(&self, confidence: f32) -> bool {
        match self {
            Strictness::Interactive => true,
            Strictness::Bulk { confidence_floor } => confidence >= *confidence_floor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    NoFace,
    LowConfidence { confidence: f32 },
}

/// An input image that contributed nothing, by position in the request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SkippedImage {
    pub index: usize,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Debug, Clone)]
pub struct Enrollment {
    pub embedding: Embedding,
    pub images_used: usize,
    pub skipped: Vec<SkippedImage>,
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no usable face in any of {images} images")]
    NoValidFaces { images: usize },
    #[error("image {index}: {source}")]
    Image {
        index: usize,
        #[source]
        source: ImageError,
    },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Clone, Copy)]
pub struct Enroller {
    strictness: Strictness,
}

impl Enroller {
    pub fn new(strictness: Strictness) -> Self {
        Self { strictness }
    }

    /// Embed the best face of every image and average the results.
    ///
    /// Each per-image embedding is normalized before averaging and the mean
    /// is normalized again.
    pub fn enroll(&self, inference: &mut Inference, images: &[ImageInput]) -> Result<Enrollment, EnrollError> {
        let mut embeddings = Vec::with_capacity(images.len());
        let mut skipped = Vec::new();

        for (index, input) in images.iter().enumerate() {
            let image = input
                .decode()
                .map_err(|source| EnrollError::Image { index, source })?;
            let faces = inference.detect(&image)?;

            let Some(face) = best_detection(&faces) else {
                tracing::warn!(index, "enroll: no face detected, skipping image");
                skipped.push(SkippedImage { index, reason: SkipReason::NoFace });
                continue;
            };
            if !self.strictness.accepts(face.confidence) {
                tracing::warn!(index, confidence = face.confidence, "enroll: detection below floor, skipping image");
                skipped.push(SkippedImage {
                    index,
                    reason: SkipReason::LowConfidence { confidence: face.confidence },
                });
                continue;
            }

            embeddings.push(inference.embed_face(&image, face)?);
        }

        if embeddings.is_empty() {
            return Err(EnrollError::NoValidFaces { images: images.len() });
        }

        let embedding = Embedding::mean(&embeddings).map_err(PipelineError::from)?;
        tracing::info!(
            used = embeddings.len(),
            skipped = skipped.len(),
            "enroll: averaged embedding computed"
        );

        Ok(Enrollment {
            embedding,
            images_used: embeddings.len(),
            skipped,
        })
    }
}
