//! rollcall-core — Face-recognition engine for attendance taking.
//!
//! Uses SCRFD for face detection and FaceNet for 512-d face embeddings,
//! both running via ONNX Runtime for CPU inference. Enrolled identities are
//! kept per (owner, group) in small postcard files.

pub mod detector;
pub mod enroll;
pub mod input;
pub mod matcher;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

use std::path::{Path, PathBuf};

pub use detector::{FaceDetector, ScrfdDetector};
pub use enroll::{Enrollment, SkipReason, SkippedImage, Strictness};
pub use input::{ChannelOrder, ImageError, ImageInput};
pub use matcher::{CosineMatcher, Matcher};
pub use recognizer::{EmbeddingModel, FaceNetModel};
pub use service::{
    enrollment_images, parse_confidence_floor, BatchReport, BatchWrite, EnrollmentRequest, IdentityOutcome,
    IdentityReport, RecognitionConfig, RecognitionService, ServiceError, VerifyOutcome, VerifyScope,
};
pub use store::{EmbeddingStore, StoreError, StoreId};
pub use types::{
    BoundingBox, Embedding, FaceDetection, FaceMatch, GroupEmbeddings, IdentityKey, KeyScheme, MatchResult,
};

/// SCRFD detection model file name.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// FaceNet (VGGFace2, 512-d) embedding model file name.
pub const EMBEDDING_MODEL_FILE: &str = "20180402-114759.onnx";

/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    data_home().join("rollcall").join("models")
}

/// `$XDG_DATA_HOME/rollcall/embeddings`, falling back to `~/.local/share`.
pub fn default_store_dir() -> PathBuf {
    data_home().join("rollcall").join("embeddings")
}

fn data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
}

/// Locations of the two ONNX models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub embedding: PathBuf,
}

impl ModelPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL_FILE),
            embedding: dir.join(EMBEDDING_MODEL_FILE),
        }
    }
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self::in_dir(&default_model_dir())
    }
}
