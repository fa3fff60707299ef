//! FaceNet embedding inference via ONNX Runtime.
//!
//! Produces raw 512-dimensional vectors from preprocessed 160×160 crops
//! (model 20180402-114759). Normalization is the caller's job, see
//! [`Embedding::from_raw`](crate::Embedding::from_raw).

use crate::preprocess::FaceTensor;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// Output size of the 20180402-114759 FaceNet model.
pub const FACENET_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("embedding model not found: {0}")]
    ModelNotFound(String),
    #[error("unsupported embedding model: {0}")]
    UnsupportedModel(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a preprocessed face to a raw embedding vector.
///
/// `embed` is a pure function of its input but the inference context behind
/// it is not safe to call concurrently, so it takes `&mut self`.
pub trait EmbeddingModel: Send {
    fn embed(&mut self, face: &FaceTensor) -> Result<Vec<f32>, RecognizerError>;

    /// Length of the vectors `embed` returns.
    fn dimension(&self) -> usize;
}

/// FaceNet ONNX session.
pub struct FaceNetModel {
    session: Session,
    dimension: usize,
}

impl FaceNetModel {
    /// Load the model once at startup. A missing artifact is fatal.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.is_file() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let inputs: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
        tracing::info!(
            path = %model_path.display(),
            ?inputs,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        // TF exports carry a phase_train placeholder unless it was frozen away.
        if inputs.len() != 1 {
            return Err(RecognizerError::UnsupportedModel(format!(
                "expected a single image input, found {inputs:?}; export with phase_train frozen to false"
            )));
        }

        Ok(Self {
            session,
            dimension: FACENET_EMBEDDING_DIM,
        })
    }
}

impl EmbeddingModel for FaceNetModel {
    fn embed(&mut self, face: &FaceTensor) -> Result<Vec<f32>, RecognizerError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(face.as_array().view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        check_dimension(raw, self.dimension)?;
        Ok(raw.to_vec())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn check_dimension(raw: &[f32], expected: usize) -> Result<(), RecognizerError> {
    if raw.len() != expected {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {expected}-dim embedding, got {}",
            raw.len()
        )));
    }
    Ok(())
}
