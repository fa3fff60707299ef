//! Face detection.
//!
//! [`FaceDetector`] is the seam the rest of the pipeline depends on.
//! [`ScrfdDetector`] implements it with the SCRFD model via ONNX Runtime:
//! letterboxed RGB input, three-stride anchor-free decoding, then NMS.

use crate::types::{BoundingBox, FaceDetection};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Default minimum score for a candidate box to survive decoding.
pub const DEFAULT_DETECTION_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detection model not found: {0}")]
    ModelNotFound(String),
    #[error("detection failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a decoded RGB image.
///
/// Implementations own an inference context, hence `&mut self`.
/// An image without faces yields `Ok(vec![])`.
pub trait FaceDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError>;
}

/// Scale and padding applied when fitting an image into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: usize) -> (Self, u32, u32) {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, target as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, target as u32);
        let letterbox = Self {
            scale,
            pad_x: (target as u32 - new_w) as f32 / 2.0,
            pad_y: (target as u32 - new_h) as f32 / 2.0,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point from model input space back to the original image.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputIndices = (usize, usize, usize);

/// Raw SCRFD outputs for a single stride level.
struct StrideOutputs<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// SCRFD face detector (e.g. `det_10g.onnx`).
pub struct ScrfdDetector {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
    threshold: f32,
}

impl ScrfdDetector {
    /// Load the SCRFD model. A missing file is an error, never a fallback.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.is_file() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
            threshold: DEFAULT_DETECTION_THRESHOLD,
        })
    }

    /// Override the per-box score threshold applied before NMS.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
        let (letterbox, new_w, new_h) =
            Letterbox::fit(image.width(), image.height(), SCRFD_INPUT_SIZE);
        let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

        // Padding is left at zero, which is SCRFD_MEAN after normalization.
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        let x0 = letterbox.pad_x.floor() as usize;
        let y0 = letterbox.pad_y.floor() as usize;
        for (x, y, px) in resized.enumerate_pixels() {
            let (tx, ty) = (x0 + x as usize, y0 + y as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (px.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, letterbox)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = Self::preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let level = StrideOutputs {
                stride,
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(decode_stride(&level, &letterbox, self.threshold));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection complete");
        Ok(faces)
    }
}

/// Map output tensors to stride slots.
///
/// Named exports ("score_8", "bbox_16", "kps_32", ...) are matched by name;
/// anything else falls back to positional order: scores, bboxes, kps, each
/// for strides 8/16/32.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::info!(
                ?names,
                "SCRFD output names not recognized, using positional mapping"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

fn decode_stride(level: &StrideOutputs<'_>, letterbox: &Letterbox, threshold: f32) -> Vec<FaceDetection> {
    let stride = level.stride;
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = level.scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(dist) = level.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * s;
        let ay = (cell / grid_w) as f32 * s;

        let (x1, y1) = letterbox.unmap(ax - dist[0] * s, ay - dist[1] * s);
        let (x2, y2) = letterbox.unmap(ax + dist[2] * s, ay + dist[3] * s);

        let landmarks = level.kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
        });

        detections.push(FaceDetection {
            bbox: BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
            confidence: score.clamp(0.0, 1.0),
            landmarks,
        });
    }
    detections
}

/// Greedy non-maximum suppression. Output is sorted by descending confidence.
fn nms(mut detections: Vec<FaceDetection>, iou_threshold: f32) -> Vec<FaceDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceDetection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}
