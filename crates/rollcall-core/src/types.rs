use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Axis-aligned face box in pixel coordinates of the decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// A single detected face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    /// Detector score in [0, 1].
    pub confidence: f32,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding has zero norm and cannot be normalized")]
    Degenerate,
    #[error("embedding contains non-finite values")]
    NonFinite,
    #[error("no embeddings to average")]
    Empty,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Unit-length face embedding.
///
/// The only way to build one from model output is [`Embedding::from_raw`],
/// which L2-normalizes, so every value of this type satisfies ‖v‖ = 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// L2-normalize a raw model vector.
    pub fn from_raw(raw: Vec<f32>) -> Result<Self, EmbeddingError> {
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        let norm = l2_norm(&raw);
        if norm <= f32::EPSILON {
            return Err(EmbeddingError::Degenerate);
        }
        Ok(Self {
            values: raw.into_iter().map(|v| v / norm).collect(),
        })
    }

    /// Element-wise mean of unit embeddings, re-normalized.
    pub fn mean(embeddings: &[Embedding]) -> Result<Self, EmbeddingError> {
        let first = embeddings.first().ok_or(EmbeddingError::Empty)?;
        let dim = first.dimension();
        let mut sum = vec![0.0f32; dim];
        for e in embeddings {
            if e.dimension() != dim {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: dim,
                    actual: e.dimension(),
                });
            }
            for (acc, v) in sum.iter_mut().zip(&e.values) {
                *acc += v;
            }
        }
        let n = embeddings.len() as f32;
        Self::from_raw(sum.into_iter().map(|v| v / n).collect())
    }

    /// Rebuild an embedding read back from storage, bit-for-bit.
    pub(crate) fn from_stored(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    /// Cosine similarity. Both sides are unit vectors, so this is the dot product.
    ///
    /// Callers compare embeddings from the same model only; mixed dimensions
    /// are rejected before matching.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        debug_assert_eq!(
            self.dimension(),
            other.dimension(),
            "similarity between embeddings of different dimension"
        );
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Identifier of one person within a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_stored(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdentityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeyError {
    #[error("identity key is empty")]
    Empty,
    #[error("identity key {0:?} is not a numeric id")]
    NotNumeric(String),
}

/// How callers name identities inside a group.
///
/// Roster enrollment keys people by display name; per-person enrollment
/// keys them by numeric id. A deployment picks one per store family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScheme {
    #[default]
    Name,
    NumericId,
}

impl KeyScheme {
    /// Validate and canonicalize a raw key.
    pub fn key(&self, raw: &str) -> Result<IdentityKey, KeyError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(KeyError::Empty);
        }
        match self {
            KeyScheme::Name => Ok(IdentityKey(trimmed.to_string())),
            KeyScheme::NumericId => trimmed
                .parse::<u64>()
                .map(|id| IdentityKey(id.to_string()))
                .map_err(|_| KeyError::NotNumeric(trimmed.to_string())),
        }
    }
}

/// Ordered identity → embedding mapping for one group.
///
/// Iteration follows insertion order; re-assigning an existing key keeps its
/// position. Matching relies on this order to break ties deterministically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupEmbeddings {
    entries: Vec<(IdentityKey, Embedding)>,
}

impl GroupEmbeddings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Common dimension of all stored embeddings, if any are stored.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|(_, e)| e.dimension())
    }

    pub fn get(&self, key: &str) -> Option<&Embedding> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, e)| e)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace, returning the previous embedding for `key`.
    pub fn insert(
        &mut self,
        key: IdentityKey,
        embedding: Embedding,
    ) -> Result<Option<Embedding>, EmbeddingError> {
        if let Some(dim) = self.dimension() {
            if embedding.dimension() != dim {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: dim,
                    actual: embedding.dimension(),
                });
            }
        }
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Ok(Some(std::mem::replace(slot, embedding))),
            None => {
                self.entries.push((key, embedding));
                Ok(None)
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IdentityKey, &Embedding)> {
        self.entries.iter().map(|(k, e)| (k, e))
    }

    pub fn keys(&self) -> impl Iterator<Item = &IdentityKey> {
        self.entries.iter().map(|(k, _)| k)
    }
}

/// Outcome of a 1:N search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Best identity strictly above the threshold, if any.
    pub key: Option<IdentityKey>,
    /// Highest similarity seen, reported even without a match.
    /// `-1.0` when the gallery is empty.
    pub similarity: f32,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.key.is_some()
    }
}

/// Recognition result for one face of a multi-face image.
#[derive(Debug, Clone, Serialize)]
pub struct FaceMatch {
    pub face_index: usize,
    pub detection: FaceDetection,
    #[serde(flatten)]
    pub result: MatchResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(values: &[f32]) -> Embedding {
        Embedding::from_raw(values.to_vec()).unwrap()
    }

    #[test]
    fn test_from_raw_normalizes() {
        let e = unit(&[3.0, 4.0]);
        assert!((e.norm() - 1.0).abs() < 1e-6);
        assert!((e.values()[0] - 0.6).abs() < 1e-6);
        assert!((e.values()[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_from_raw_rejects_zero_vector() {
        assert_eq!(Embedding::from_raw(vec![0.0; 4]), Err(EmbeddingError::Degenerate));
    }

    #[test]
    fn test_from_raw_rejects_nan() {
        assert_eq!(
            Embedding::from_raw(vec![1.0, f32::NAN]),
            Err(EmbeddingError::NonFinite)
        );
    }

    #[test]
    fn test_similarity_identical_orthogonal_opposite() {
        let a = unit(&[1.0, 0.0]);
        assert!((a.similarity(&unit(&[2.0, 0.0])) - 1.0).abs() < 1e-6);
        assert!(a.similarity(&unit(&[0.0, 1.0])).abs() < 1e-6);
        assert!((a.similarity(&unit(&[-1.0, 0.0])) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mean_is_unit_and_bisects() {
        let m = Embedding::mean(&[unit(&[1.0, 0.0]), unit(&[0.0, 1.0])]).unwrap();
        assert!((m.norm() - 1.0).abs() < 1e-6);
        let h = std::f32::consts::FRAC_1_SQRT_2;
        assert!((m.values()[0] - h).abs() < 1e-6);
        assert!((m.values()[1] - h).abs() < 1e-6);
    }

    #[test]
    fn test_mean_order_invariant() {
        let a = unit(&[0.9, 0.1, 0.3]);
        let b = unit(&[0.2, 0.7, 0.1]);
        let c = unit(&[0.4, 0.4, 0.8]);
        let m1 = Embedding::mean(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let m2 = Embedding::mean(&[c, a, b]).unwrap();
        for (x, y) in m1.values().iter().zip(m2.values()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mean_empty_and_mismatch() {
        assert_eq!(Embedding::mean(&[]), Err(EmbeddingError::Empty));
        let err = Embedding::mean(&[unit(&[1.0, 0.0]), unit(&[1.0, 0.0, 0.0])]).unwrap_err();
        assert_eq!(err, EmbeddingError::DimensionMismatch { expected: 2, actual: 3 });
    }

    #[test]
    fn test_mean_of_opposites_is_degenerate() {
        let err = Embedding::mean(&[unit(&[1.0, 0.0]), unit(&[-1.0, 0.0])]).unwrap_err();
        assert_eq!(err, EmbeddingError::Degenerate);
    }

    #[test]
    fn test_key_scheme_name() {
        assert_eq!(KeyScheme::Name.key("  Alice  ").unwrap().as_str(), "Alice");
        assert_eq!(KeyScheme::Name.key("   "), Err(KeyError::Empty));
    }

    #[test]
    fn test_key_scheme_numeric_canonicalizes() {
        assert_eq!(KeyScheme::NumericId.key("007").unwrap().as_str(), "7");
        assert!(matches!(
            KeyScheme::NumericId.key("alice"),
            Err(KeyError::NotNumeric(_))
        ));
    }

    #[test]
    fn test_group_insert_replaces_in_place() {
        let mut g = GroupEmbeddings::new();
        let alice = KeyScheme::Name.key("alice").unwrap();
        let bob = KeyScheme::Name.key("bob").unwrap();
        g.insert(alice.clone(), unit(&[1.0, 0.0])).unwrap();
        g.insert(bob, unit(&[0.0, 1.0])).unwrap();
        let prev = g.insert(alice, unit(&[1.0, 1.0])).unwrap();

        assert!(prev.is_some());
        assert_eq!(g.len(), 2);
        let order: Vec<&str> = g.keys().map(|k| k.as_str()).collect();
        assert_eq!(order, vec!["alice", "bob"]);
        assert!((g.get("alice").unwrap().values()[0] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_group_rejects_dimension_mismatch() {
        let mut g = GroupEmbeddings::new();
        g.insert(KeyScheme::Name.key("a").unwrap(), unit(&[1.0, 0.0])).unwrap();
        let err = g
            .insert(KeyScheme::Name.key("b").unwrap(), unit(&[1.0, 0.0, 0.0]))
            .unwrap_err();
        assert_eq!(err, EmbeddingError::DimensionMismatch { expected: 2, actual: 3 });
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 };
        let b = BoundingBox { x: 5.0, y: 0.0, width: 10.0, height: 10.0 };
        let far = BoundingBox { x: 20.0, y: 20.0, width: 10.0, height: 10.0 };
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert!(a.iou(&far).abs() < 1e-6);
    }
}
