//! The recognition service: one owned object composing detection, embedding,
//! storage, enrollment, recognition and verification.
//!
//! Host applications construct it once and share it by reference. All
//! detector and model calls run inside a single critical section; store
//! access is locked per (owner, group).

use crate::detector::{DetectorError, ScrfdDetector, DEFAULT_DETECTION_THRESHOLD};
use crate::enroll::{EnrollError, Enroller, Enrollment, SkippedImage, Strictness, DEFAULT_ENROLL_CONFIDENCE_FLOOR};
use crate::input::{ImageError, ImageInput};
use crate::matcher::{self, CosineMatcher, Matcher, VerifyError, DEFAULT_SIMILARITY_THRESHOLD};
use crate::pipeline::{best_detection, Inference, PipelineError};
use crate::recognizer::{EmbeddingModel, FaceNetModel, RecognizerError};
use crate::store::{EmbeddingStore, StoreError, StoreId};
use crate::types::{EmbeddingError, FaceDetection, FaceMatch, GroupEmbeddings, IdentityKey, KeyError, KeyScheme};
use crate::{detector::FaceDetector, ModelPaths};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const ENROLLMENT_IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("no valid faces for {key} in {images} images")]
    NoValidFaces { key: String, images: usize },
    #[error("no embeddings enrolled for group {0}")]
    NoEmbeddingsForGroup(StoreId),
    #[error("identity {0} is not enrolled")]
    IdentityNotEnrolled(String),
    #[error("no enrollment images in {0}")]
    NoEnrollmentImages(PathBuf),
    #[error("invalid identity key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("loading detector: {0}")]
    DetectorLoad(#[from] DetectorError),
    #[error("loading embedding model: {0}")]
    ModelLoad(#[from] RecognizerError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ServiceError {
    fn from_enroll(key: &IdentityKey, err: EnrollError) -> Self {
        match err {
            EnrollError::NoValidFaces { images } => ServiceError::NoValidFaces {
                key: key.to_string(),
                images,
            },
            EnrollError::Image { source, .. } => ServiceError::Image(source),
            EnrollError::Pipeline(e) => ServiceError::Pipeline(e),
        }
    }
}

/// Which stores a verification may consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyScope {
    /// Only the claimed group's store.
    #[default]
    ClaimedGroup,
    /// The claimed group first, then every other persisted store.
    AllGroups,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Cosine similarity a match must strictly exceed.
    pub similarity_threshold: f32,
    /// Per-box detector score kept before NMS.
    pub detection_threshold: f32,
    /// Detection floor for bulk (photo-directory) enrollment.
    pub enroll_confidence_floor: f32,
    /// Detection floor for verification probes; `None` accepts any face.
    /// Files may spell `None` as `"off"` or `"none"`.
    #[serde(deserialize_with = "deserialize_floor")]
    pub probe_confidence_floor: Option<f32>,
    pub verify_scope: VerifyScope,
    pub key_scheme: KeyScheme,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            detection_threshold: DEFAULT_DETECTION_THRESHOLD,
            enroll_confidence_floor: DEFAULT_ENROLL_CONFIDENCE_FLOOR,
            probe_confidence_floor: Some(DEFAULT_ENROLL_CONFIDENCE_FLOOR),
            verify_scope: VerifyScope::ClaimedGroup,
            key_scheme: KeyScheme::Name,
        }
    }
}

impl RecognitionConfig {
    pub fn bulk_strictness(&self) -> Strictness {
        Strictness::Bulk {
            confidence_floor: self.enroll_confidence_floor,
        }
    }
}

/// Parse an optional confidence floor: a number, or `off` / `none` to disable it.
pub fn parse_confidence_floor(raw: &str) -> Result<Option<f32>, String> {
    match raw.trim() {
        "off" | "none" => Ok(None),
        other => other
            .parse::<f32>()
            .map(Some)
            .map_err(|_| format!("expected a number, \"off\" or \"none\", got {raw:?}")),
    }
}

fn deserialize_floor<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Floor {
        Value(f32),
        Word(String),
    }

    match Option::<Floor>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Floor::Value(v)) => Ok(Some(v)),
        Some(Floor::Word(w)) => parse_confidence_floor(&w).map_err(serde::de::Error::custom),
    }
}

/// Result of a 1:1 verification request. Anything but `Verified` is a non-match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerifyOutcome {
    Verified { similarity: f32 },
    Rejected { similarity: f32 },
    NoFace,
    LowConfidence { confidence: f32 },
}

impl VerifyOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, VerifyOutcome::Verified { .. })
    }
}

/// Images for one identity in a batch enrollment.
#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub key: String,
    pub images: Vec<ImageInput>,
}

/// What a batch enrollment does with identities already in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchWrite {
    /// The store becomes exactly the successfully enrolled identities.
    Replace,
    /// Enrolled identities are merged into the existing store.
    Merge,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IdentityOutcome {
    Enrolled { images_used: usize },
    EnrolledWithWarnings { images_used: usize, skipped: Vec<SkippedImage> },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityReport {
    pub key: String,
    #[serde(flatten)]
    pub outcome: IdentityOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub store: StoreId,
    pub identities: Vec<IdentityReport>,
    /// False when nothing succeeded and the store was left untouched.
    pub saved: bool,
}

impl BatchReport {
    pub fn enrolled(&self) -> usize {
        self.identities
            .iter()
            .filter(|r| !matches!(r.outcome, IdentityOutcome::Failed { .. }))
            .count()
    }
}

pub struct RecognitionService {
    inference: Mutex<Inference>,
    embedding_dimension: usize,
    store: EmbeddingStore,
    matcher: CosineMatcher,
    config: RecognitionConfig,
}

impl RecognitionService {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        model: Box<dyn EmbeddingModel>,
        store: EmbeddingStore,
        config: RecognitionConfig,
    ) -> Self {
        let inference = Inference::new(detector, model);
        Self {
            embedding_dimension: inference.embedding_dimension(),
            inference: Mutex::new(inference),
            store,
            matcher: CosineMatcher,
            config,
        }
    }

    /// Load both ONNX models and open the store. Any missing artifact is fatal.
    pub fn load(models: &ModelPaths, store_root: &Path, config: RecognitionConfig) -> Result<Self, ServiceError> {
        let detector = ScrfdDetector::load(&models.detector)?.with_threshold(config.detection_threshold);
        let model = FaceNetModel::load(&models.embedding)?;
        let store = EmbeddingStore::open(store_root)?;
        tracing::info!(
            threshold = config.similarity_threshold,
            detection_threshold = config.detection_threshold,
            scope = ?config.verify_scope,
            store = %store_root.display(),
            "recognition service ready"
        );
        Ok(Self::new(Box::new(detector), Box::new(model), store, config))
    }

    pub fn config(&self) -> &RecognitionConfig {
        &self.config
    }

    /// Validate a raw key against the configured scheme.
    pub fn key(&self, raw: &str) -> Result<IdentityKey, ServiceError> {
        Ok(self.config.key_scheme.key(raw)?)
    }

    /// Stored vectors must come from a model with the same output size.
    fn ensure_dimension(&self, store_id: &StoreId, gallery: &GroupEmbeddings) -> Result<(), ServiceError> {
        match gallery.dimension() {
            Some(actual) if actual != self.embedding_dimension => {
                tracing::warn!(
                    store = %store_id,
                    expected = self.embedding_dimension,
                    actual,
                    "store was written by a different embedding model"
                );
                Err(ServiceError::Pipeline(PipelineError::Embedding(
                    EmbeddingError::DimensionMismatch {
                        expected: self.embedding_dimension,
                        actual,
                    },
                )))
            }
            _ => Ok(()),
        }
    }

    fn inference(&self) -> MutexGuard<'_, Inference> {
        self.inference.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("inference lock poisoned by an earlier panic; continuing");
            poisoned.into_inner()
        })
    }

    /// Face boxes and confidences in an image.
    pub fn detect(&self, input: &ImageInput) -> Result<Vec<FaceDetection>, ServiceError> {
        let image = input.decode()?;
        Ok(self.inference().detect(&image)?)
    }

    /// 1:N recognition of every face in `input` against one group.
    ///
    /// An image without faces gives an empty list. A face that fails to
    /// embed is logged and left out.
    pub fn recognize(&self, store_id: &StoreId, input: &ImageInput) -> Result<Vec<FaceMatch>, ServiceError> {
        let gallery = self.store.load(store_id)?;
        if gallery.is_empty() {
            return Err(ServiceError::NoEmbeddingsForGroup(store_id.clone()));
        }
        self.ensure_dimension(store_id, &gallery)?;
        let image = input.decode()?;

        let mut inference = self.inference();
        let faces = inference.detect(&image)?;
        tracing::debug!(store = %store_id, faces = faces.len(), identities = gallery.len(), "recognize");

        let mut results = Vec::with_capacity(faces.len());
        for (face_index, face) in faces.into_iter().enumerate() {
            let probe = match inference.embed_face(&image, &face) {
                Ok(probe) => probe,
                Err(e) => {
                    tracing::warn!(face_index, error = %e, "recognize: skipping face");
                    continue;
                }
            };
            let result = self
                .matcher
                .best_match(&probe, &gallery, self.config.similarity_threshold);
            tracing::debug!(
                face_index,
                key = ?result.key.as_ref().map(|k| k.as_str()),
                similarity = result.similarity,
                "recognize: face compared"
            );
            results.push(FaceMatch {
                face_index,
                detection: face,
                result,
            });
        }
        Ok(results)
    }

    /// 1:1 verification of `claimed_key` using the best face in `input`.
    pub fn verify(&self, store_id: &StoreId, claimed_key: &str, input: &ImageInput) -> Result<VerifyOutcome, ServiceError> {
        let key = self.key(claimed_key)?;
        let candidates = self.verification_candidates(store_id)?;
        let Some((holder, gallery)) = candidates.iter().find(|(_, g)| g.contains(key.as_str())) else {
            return Err(ServiceError::IdentityNotEnrolled(key.to_string()));
        };
        self.ensure_dimension(holder, gallery)?;

        let image = input.decode()?;
        let probe = {
            let mut inference = self.inference();
            let faces = inference.detect(&image)?;
            let Some(face) = best_detection(&faces) else {
                tracing::info!(key = %key, "verify: no face in probe");
                return Ok(VerifyOutcome::NoFace);
            };
            if let Some(floor) = self.config.probe_confidence_floor {
                if face.confidence < floor {
                    tracing::info!(key = %key, confidence = face.confidence, "verify: probe below confidence floor");
                    return Ok(VerifyOutcome::LowConfidence {
                        confidence: face.confidence,
                    });
                }
            }
            inference.embed_face(&image, face)?
        };

        let verification = matcher::verify(
            &probe,
            key.as_str(),
            candidates.iter().map(|(_, g)| g),
            self.config.similarity_threshold,
        )
        .map_err(|VerifyError::IdentityNotEnrolled(k)| ServiceError::IdentityNotEnrolled(k))?;
        tracing::info!(key = %key, matched = verification.matched, similarity = verification.similarity, "verify");

        Ok(if verification.matched {
            VerifyOutcome::Verified {
                similarity: verification.similarity,
            }
        } else {
            VerifyOutcome::Rejected {
                similarity: verification.similarity,
            }
        })
    }

    /// Stores a verification may consult, claimed group first.
    fn verification_candidates(&self, store_id: &StoreId) -> Result<Vec<(StoreId, GroupEmbeddings)>, ServiceError> {
        let mut candidates = vec![(store_id.clone(), self.store.load(store_id)?)];
        if self.config.verify_scope == VerifyScope::AllGroups {
            for other in self.store.list_stores(None)? {
                if other != *store_id {
                    let gallery = self.store.load(&other)?;
                    candidates.push((other, gallery));
                }
            }
        }
        Ok(candidates)
    }

    /// Enroll or re-enroll one identity and upsert it into the group's store.
    pub fn enroll(
        &self,
        store_id: &StoreId,
        raw_key: &str,
        images: &[ImageInput],
        strictness: Strictness,
    ) -> Result<Enrollment, ServiceError> {
        let key = self.key(raw_key)?;
        let enrollment = {
            let mut inference = self.inference();
            Enroller::new(strictness)
                .enroll(&mut inference, images)
                .map_err(|e| ServiceError::from_enroll(&key, e))?
        };
        let previous = self
            .store
            .upsert(store_id, key.clone(), enrollment.embedding.clone())?;
        tracing::info!(
            store = %store_id,
            key = %key,
            used = enrollment.images_used,
            re_enrolled = previous.is_some(),
            "identity enrolled"
        );
        Ok(enrollment)
    }

    /// Recompute an identity from its stored photo directory (bulk strictness).
    pub fn enroll_from_dir(&self, store_id: &StoreId, raw_key: &str, dir: &Path) -> Result<Enrollment, ServiceError> {
        let images = enrollment_images(dir)?;
        if images.is_empty() {
            return Err(ServiceError::NoEnrollmentImages(dir.to_path_buf()));
        }
        tracing::debug!(dir = %dir.display(), images = images.len(), "enrolling from directory");
        self.enroll(store_id, raw_key, &images, self.config.bulk_strictness())
    }

    /// Enroll many identities, then write the store once.
    ///
    /// A failing identity is reported and never aborts the batch.
    pub fn enroll_batch(
        &self,
        store_id: &StoreId,
        requests: Vec<EnrollmentRequest>,
        strictness: Strictness,
        write: BatchWrite,
    ) -> Result<BatchReport, ServiceError> {
        let mut target = match write {
            BatchWrite::Replace => GroupEmbeddings::new(),
            BatchWrite::Merge => self.store.load(store_id)?,
        };
        let enroller = Enroller::new(strictness);
        let mut identities = Vec::with_capacity(requests.len());

        for request in requests {
            let outcome = self.enroll_one(&enroller, &mut target, &request);
            if let IdentityOutcome::Failed { reason } = &outcome {
                tracing::warn!(store = %store_id, key = %request.key, reason = %reason, "batch: identity failed");
            }
            identities.push(IdentityReport {
                key: request.key,
                outcome,
            });
        }

        let mut report = BatchReport {
            store: store_id.clone(),
            identities,
            saved: false,
        };
        if report.enrolled() > 0 {
            self.store.save(store_id, &target)?;
            report.saved = true;
        }
        tracing::info!(
            store = %store_id,
            enrolled = report.enrolled(),
            total = report.identities.len(),
            saved = report.saved,
            "batch enrollment finished"
        );
        Ok(report)
    }

    fn enroll_one(&self, enroller: &Enroller, target: &mut GroupEmbeddings, request: &EnrollmentRequest) -> IdentityOutcome {
        let result = self.key(&request.key).and_then(|key| {
            let enrollment = {
                let mut inference = self.inference();
                enroller
                    .enroll(&mut inference, &request.images)
                    .map_err(|e| ServiceError::from_enroll(&key, e))?
            };
            target
                .insert(key, enrollment.embedding.clone())
                .map_err(|e| ServiceError::Pipeline(e.into()))?;
            Ok(enrollment)
        });

        match result {
            Ok(e) if e.skipped.is_empty() => IdentityOutcome::Enrolled {
                images_used: e.images_used,
            },
            Ok(e) => IdentityOutcome::EnrolledWithWarnings {
                images_used: e.images_used,
                skipped: e.skipped,
            },
            Err(e) => IdentityOutcome::Failed { reason: e.to_string() },
        }
    }

    /// Copy an enrolled identity's embedding into another group's store.
    ///
    /// With `from = None` the first persisted store holding the key is used.
    pub fn transfer_identity(&self, raw_key: &str, from: Option<&StoreId>, to: &StoreId) -> Result<(), ServiceError> {
        let key = self.key(raw_key)?;
        let (source, embedding) = match from {
            Some(id) => {
                let embedding = self.store.load(id)?.get(key.as_str()).cloned();
                (Some(id.clone()), embedding)
            }
            None => match self.store.find_identity(key.as_str())? {
                Some((id, embedding)) => (Some(id), Some(embedding)),
                None => (None, None),
            },
        };
        let embedding = embedding.ok_or_else(|| ServiceError::IdentityNotEnrolled(key.to_string()))?;

        self.store.upsert(to, key.clone(), embedding)?;
        tracing::info!(key = %key, from = ?source.map(|s| s.to_string()), to = %to, "identity transferred");
        Ok(())
    }

    pub fn list_identities(&self, store_id: &StoreId) -> Result<Vec<IdentityKey>, ServiceError> {
        Ok(self.store.load(store_id)?.keys().cloned().collect())
    }
}

/// Image files (`jpg`, `jpeg`, `png`) of a photo directory, sorted by name.
pub fn enrollment_images(dir: &Path) -> Result<Vec<ImageInput>, ServiceError> {
    let io_err = |source| ServiceError::Io {
        path: dir.to_path_buf(),
        source,
    };
    if !dir.is_dir() {
        return Err(ServiceError::NoEnrollmentImages(dir.to_path_buf()));
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()).map_err(io_err))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| ENROLLMENT_IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    paths.sort();
    Ok(paths.into_iter().map(ImageInput::Path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{color_detector, face_at, solid, CenterPixelModel, FnDetector};
    use image::RgbImage;

    const RED: [u8; 3] = [200, 0, 0];
    const GREEN: [u8; 3] = [0, 200, 0];
    const BLUE: [u8; 3] = [30, 60, 220];
    const BLACK: [u8; 3] = [0, 0, 0];
    const WEAK: [u8; 3] = [200, 1, 90];

    fn service_with(config: RecognitionConfig) -> (tempfile::TempDir, RecognitionService) {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::open(dir.path()).unwrap();
        let service = RecognitionService::new(
            Box::new(color_detector()),
            Box::new(CenterPixelModel),
            store,
            config,
        );
        (dir, service)
    }

    fn service() -> (tempfile::TempDir, RecognitionService) {
        service_with(RecognitionConfig::default())
    }

    fn class(group: &str) -> StoreId {
        StoreId::new("1", group).unwrap()
    }

    #[test]
    fn test_recognize_empty_store_errors() {
        let (_dir, svc) = service();
        let err = svc.recognize(&class("math"), &solid(RED)).unwrap_err();
        assert!(matches!(err, ServiceError::NoEmbeddingsForGroup(_)));
    }

    #[test]
    fn test_enroll_then_recognize() {
        let (_dir, svc) = service();
        let id = class("math");
        svc.enroll(&id, "alice", &[solid(RED)], Strictness::Interactive).unwrap();
        svc.enroll(&id, "bob", &[solid(GREEN)], Strictness::Interactive).unwrap();

        let matches = svc.recognize(&id, &solid(RED)).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].face_index, 0);
        assert_eq!(matches[0].result.key.as_ref().map(|k| k.as_str()), Some("alice"));
        assert!((matches[0].result.similarity - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_recognize_unknown_face_reports_similarity() {
        let (_dir, svc) = service();
        let id = class("math");
        svc.enroll(&id, "alice", &[solid(RED)], Strictness::Interactive).unwrap();

        let matches = svc.recognize(&id, &solid(GREEN)).unwrap();
        assert_eq!(matches.len(), 1);
        assert!(!matches[0].result.is_match());
        assert!(matches[0].result.similarity < 0.6);
    }

    #[test]
    fn test_recognize_no_face_is_empty() {
        let (_dir, svc) = service();
        let id = class("math");
        svc.enroll(&id, "alice", &[solid(RED)], Strictness::Interactive).unwrap();
        assert!(svc.recognize(&id, &solid(BLACK)).unwrap().is_empty());
    }

    #[test]
    fn test_recognize_unsupported_format() {
        let (_dir, svc) = service();
        let id = class("math");
        svc.enroll(&id, "alice", &[solid(RED)], Strictness::Interactive).unwrap();
        let err = svc
            .recognize(&id, &ImageInput::Encoded(b"not an image".to_vec()))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Image(ImageError::UnsupportedImageFormat(_))));
    }

    #[test]
    fn test_recognize_multiple_faces() {
        let dir = tempfile::tempdir().unwrap();
        let detector = FnDetector(|img: &RgbImage| {
            if img.width() == 64 {
                vec![face_at(4.0, 4.0, 24.0, 0.9), face_at(36.0, 4.0, 24.0, 0.8)]
            } else {
                vec![face_at(4.0, 4.0, 24.0, 0.99)]
            }
        });
        let svc = RecognitionService::new(
            Box::new(detector),
            Box::new(CenterPixelModel),
            EmbeddingStore::open(dir.path()).unwrap(),
            RecognitionConfig::default(),
        );
        let id = class("math");
        svc.enroll(&id, "alice", &[solid(RED)], Strictness::Interactive).unwrap();
        svc.enroll(&id, "bob", &[solid(GREEN)], Strictness::Interactive).unwrap();

        let img = RgbImage::from_fn(64, 32, |x, _| image::Rgb(if x < 32 { GREEN } else { RED }));
        let input = ImageInput::Pixels {
            data: img.into_raw(),
            width: 64,
            height: 32,
            order: crate::input::ChannelOrder::Rgb,
        };
        let matches = svc.recognize(&id, &input).unwrap();
        let keys: Vec<_> = matches
            .iter()
            .map(|m| (m.face_index, m.result.key.as_ref().map(|k| k.to_string())))
            .collect();
        assert_eq!(
            keys,
            vec![(0, Some("bob".to_string())), (1, Some("alice".to_string()))]
        );
    }

    #[test]
    fn test_verify_exact_probe() {
        let (_dir, svc) = service();
        let id = class("math");
        svc.enroll(&id, "alice", &[solid(RED)], Strictness::Interactive).unwrap();

        let outcome = svc.verify(&id, "alice", &solid(RED)).unwrap();
        assert!(outcome.is_match());
        let other = svc.verify(&id, "alice", &solid(GREEN)).unwrap();
        assert!(matches!(other, VerifyOutcome::Rejected { .. }));
    }

    #[test]
    fn test_verify_not_enrolled() {
        let (_dir, svc) = service();
        let id = class("math");
        svc.enroll(&id, "alice", &[solid(RED)], Strictness::Interactive).unwrap();
        let err = svc.verify(&id, "mallory", &solid(RED)).unwrap_err();
        assert!(matches!(err, ServiceError::IdentityNotEnrolled(k) if k == "mallory"));
    }

    #[test]
    fn test_verify_no_face_and_low_confidence() {
        let (_dir, svc) = service();
        let id = class("math");
        svc.enroll(&id, "alice", &[solid(RED)], Strictness::Interactive).unwrap();

        assert_eq!(svc.verify(&id, "alice", &solid(BLACK)).unwrap(), VerifyOutcome::NoFace);
        assert!(matches!(
            svc.verify(&id, "alice", &solid(WEAK)).unwrap(),
            VerifyOutcome::LowConfidence { .. }
        ));
    }

    #[test]
    fn test_verify_scope() {
        let (_dir, svc) = service();
        svc.enroll(&class("art"), "alice", &[solid(RED)], Strictness::Interactive).unwrap();
        svc.enroll(&class("math"), "bob", &[solid(GREEN)], Strictness::Interactive).unwrap();
        let err = svc.verify(&class("math"), "alice", &solid(RED)).unwrap_err();
        assert!(matches!(err, ServiceError::IdentityNotEnrolled(_)));

        let (_dir2, wide) = service_with(RecognitionConfig {
            verify_scope: VerifyScope::AllGroups,
            ..RecognitionConfig::default()
        });
        wide.enroll(&class("art"), "alice", &[solid(RED)], Strictness::Interactive).unwrap();
        wide.enroll(&class("math"), "bob", &[solid(GREEN)], Strictness::Interactive).unwrap();
        assert!(wide.verify(&class("math"), "alice", &solid(RED)).unwrap().is_match());
    }

    fn plant_foreign_embedding(svc: &RecognitionService, id: &StoreId, key: &str) {
        let foreign = crate::types::Embedding::from_raw(vec![0.8, -0.6]).unwrap();
        svc.store.upsert(id, svc.key(key).unwrap(), foreign).unwrap();
    }

    fn is_dimension_mismatch(err: &ServiceError) -> bool {
        matches!(
            err,
            ServiceError::Pipeline(PipelineError::Embedding(EmbeddingError::DimensionMismatch {
                expected: 3,
                actual: 2
            }))
        )
    }

    #[test]
    fn test_recognize_rejects_store_from_other_model() {
        let (_dir, svc) = service();
        let id = class("math");
        plant_foreign_embedding(&svc, &id, "mallory");

        let err = svc.recognize(&id, &solid(RED)).unwrap_err();
        assert!(is_dimension_mismatch(&err), "{err:?}");
    }

    #[test]
    fn test_verify_rejects_identity_from_other_model() {
        let (_dir, svc) = service();
        let id = class("math");
        plant_foreign_embedding(&svc, &id, "mallory");

        let err = svc.verify(&id, "mallory", &solid(RED)).unwrap_err();
        assert!(is_dimension_mismatch(&err), "{err:?}");
    }

    #[test]
    fn test_verify_all_groups_ignores_unrelated_foreign_store() {
        let (_dir, svc) = service_with(RecognitionConfig {
            verify_scope: VerifyScope::AllGroups,
            ..RecognitionConfig::default()
        });
        plant_foreign_embedding(&svc, &class("art"), "mallory");
        svc.enroll(&class("math"), "alice", &[solid(RED)], Strictness::Interactive).unwrap();

        assert!(svc.verify(&class("math"), "alice", &solid(RED)).unwrap().is_match());
    }

    #[test]
    fn test_parse_confidence_floor() {
        assert_eq!(parse_confidence_floor("0.75"), Ok(Some(0.75)));
        assert_eq!(parse_confidence_floor("off"), Ok(None));
        assert_eq!(parse_confidence_floor(" none "), Ok(None));
        assert!(parse_confidence_floor("strict").is_err());
    }

    #[test]
    fn test_enroll_no_valid_faces() {
        let (_dir, svc) = service();
        let id = class("math");
        let err = svc
            .enroll(&id, "alice", &[solid(BLACK), solid(BLACK), solid(BLACK)], Strictness::Interactive)
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoValidFaces { images: 3, .. }));
        assert!(svc.list_identities(&id).unwrap().is_empty());
    }

    #[test]
    fn test_enroll_numeric_key_scheme() {
        let (_dir, svc) = service_with(RecognitionConfig {
            key_scheme: KeyScheme::NumericId,
            ..RecognitionConfig::default()
        });
        let id = class("math");
        assert!(matches!(
            svc.enroll(&id, "alice", &[solid(RED)], Strictness::Interactive),
            Err(ServiceError::InvalidKey(_))
        ));
        svc.enroll(&id, "0042", &[solid(RED)], Strictness::Interactive).unwrap();
        assert!(svc.verify(&id, "42", &solid(RED)).unwrap().is_match());
    }

    #[test]
    fn test_re_enroll_replaces_embedding() {
        let (_dir, svc) = service();
        let id = class("math");
        svc.enroll(&id, "alice", &[solid(RED)], Strictness::Interactive).unwrap();
        svc.enroll(&id, "alice", &[solid(GREEN)], Strictness::Interactive).unwrap();

        assert_eq!(svc.list_identities(&id).unwrap().len(), 1);
        assert!(svc.verify(&id, "alice", &solid(GREEN)).unwrap().is_match());
    }

    #[test]
    fn test_batch_reports_each_identity() {
        let (_dir, svc) = service();
        let id = class("math");
        let report = svc
            .enroll_batch(
                &id,
                vec![
                    EnrollmentRequest { key: "alice".into(), images: vec![solid(RED)] },
                    EnrollmentRequest { key: "ghost".into(), images: vec![solid(BLACK)] },
                    EnrollmentRequest { key: "bob".into(), images: vec![solid(GREEN), solid(BLACK)] },
                ],
                Strictness::Interactive,
                BatchWrite::Replace,
            )
            .unwrap();

        assert!(report.saved);
        assert_eq!(report.enrolled(), 2);
        assert!(matches!(report.identities[0].outcome, IdentityOutcome::Enrolled { images_used: 1 }));
        assert!(matches!(report.identities[1].outcome, IdentityOutcome::Failed { .. }));
        assert!(matches!(
            report.identities[2].outcome,
            IdentityOutcome::EnrolledWithWarnings { images_used: 1, .. }
        ));
        let keys: Vec<String> = svc.list_identities(&id).unwrap().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["alice", "bob"]);
    }

    #[test]
    fn test_batch_replace_vs_merge() {
        let (_dir, svc) = service();
        let id = class("math");
        svc.enroll(&id, "carol", &[solid(BLUE)], Strictness::Interactive).unwrap();

        let req = || vec![EnrollmentRequest { key: "alice".into(), images: vec![solid(RED)] }];
        svc.enroll_batch(&id, req(), Strictness::Interactive, BatchWrite::Merge).unwrap();
        assert_eq!(svc.list_identities(&id).unwrap().len(), 2);

        svc.enroll_batch(&id, req(), Strictness::Interactive, BatchWrite::Replace).unwrap();
        let keys = svc.list_identities(&id).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].as_str(), "alice");
    }

    #[test]
    fn test_batch_all_failed_leaves_store_untouched() {
        let (_dir, svc) = service();
        let id = class("math");
        svc.enroll(&id, "carol", &[solid(BLUE)], Strictness::Interactive).unwrap();

        let report = svc
            .enroll_batch(
                &id,
                vec![EnrollmentRequest { key: "ghost".into(), images: vec![solid(BLACK)] }],
                Strictness::Interactive,
                BatchWrite::Replace,
            )
            .unwrap();
        assert!(!report.saved);
        assert_eq!(svc.list_identities(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_transfer_identity() {
        let (_dir, svc) = service();
        svc.enroll(&class("math"), "alice", &[solid(RED)], Strictness::Interactive).unwrap();

        svc.transfer_identity("alice", Some(&class("math")), &class("art")).unwrap();
        assert!(svc.verify(&class("art"), "alice", &solid(RED)).unwrap().is_match());
        // Source keeps the identity.
        assert!(svc.verify(&class("math"), "alice", &solid(RED)).unwrap().is_match());

        svc.transfer_identity("alice", None, &class("bio")).unwrap();
        assert_eq!(svc.list_identities(&class("bio")).unwrap().len(), 1);

        let err = svc.transfer_identity("nobody", None, &class("bio")).unwrap_err();
        assert!(matches!(err, ServiceError::IdentityNotEnrolled(_)));
    }

    #[test]
    fn test_enroll_from_dir() {
        let (dir, svc) = service();
        let photos = dir.path().join("photos");
        std::fs::create_dir_all(&photos).unwrap();
        RgbImage::from_pixel(32, 32, image::Rgb(RED)).save(photos.join("a.png")).unwrap();
        RgbImage::from_pixel(32, 32, image::Rgb(WEAK)).save(photos.join("b.png")).unwrap();
        std::fs::write(photos.join("notes.txt"), "ignored").unwrap();

        let e = svc.enroll_from_dir(&class("math"), "alice", &photos).unwrap();
        assert_eq!(e.images_used, 1);
        assert_eq!(e.skipped.len(), 1);
        assert!(svc.verify(&class("math"), "alice", &solid(RED)).unwrap().is_match());
    }

    #[test]
    fn test_enroll_from_missing_dir() {
        let (dir, svc) = service();
        let err = svc
            .enroll_from_dir(&class("math"), "alice", &dir.path().join("missing"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoEnrollmentImages(_)));
    }

    #[test]
    fn test_detect_reports_boxes() {
        let (_dir, svc) = service();
        let faces = svc.detect(&solid(RED)).unwrap();
        assert_eq!(faces.len(), 1);
        assert!((faces[0].confidence - 0.99).abs() < 1e-6);
        assert!(svc.detect(&solid(BLACK)).unwrap().is_empty());
    }
}
