//! 1:N recognition and 1:1 verification against stored embeddings.

use crate::types::{Embedding, GroupEmbeddings, MatchResult};
use serde::Serialize;
use thiserror::Error;

/// Default cosine similarity a match must strictly exceed.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;

/// Similarity reported when there is nothing to compare against.
pub const NO_CANDIDATE_SIMILARITY: f32 = -1.0;

/// Strategy for finding the best gallery entry for a probe.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &GroupEmbeddings, threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher.
///
/// Walks the gallery in its iteration order. An entry replaces the current
/// best only when strictly more similar, so ties keep the earlier entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, probe: &Embedding, gallery: &GroupEmbeddings, threshold: f32) -> MatchResult {
        let mut best_sim = NO_CANDIDATE_SIMILARITY;
        let mut best_key = None;

        for (key, stored) in gallery.iter() {
            let sim = probe.similarity(stored);
            if best_key.is_none() || sim > best_sim {
                best_sim = sim;
                best_key = Some(key);
            }
        }

        MatchResult {
            key: best_key.filter(|_| best_sim > threshold).cloned(),
            similarity: best_sim,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    #[error("identity {0} is not enrolled in any candidate store")]
    IdentityNotEnrolled(String),
}

/// Outcome of comparing a probe to one claimed identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub matched: bool,
    pub similarity: f32,
}

/// Compare `probe` with the first stored embedding for `claimed_key`.
///
/// Stores are searched in the order given; only the first hit is compared.
pub fn verify<'a, I>(
    probe: &Embedding,
    claimed_key: &str,
    candidate_stores: I,
    threshold: f32,
) -> Result<Verification, VerifyError>
where
    I: IntoIterator<Item = &'a GroupEmbeddings>,
{
    let stored = candidate_stores
        .into_iter()
        .find_map(|store| store.get(claimed_key))
        .ok_or_else(|| VerifyError::IdentityNotEnrolled(claimed_key.to_string()))?;

    let similarity = probe.similarity(stored);
    Ok(Verification {
        matched: similarity > threshold,
        similarity,
    })
}
