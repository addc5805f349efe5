use serde::{Deserialize, Serialize};

use crate::gallery::Gallery;
use crate::index::Candidate;
use crate::Embedding;

/// Similarity a candidate must reach under [`AcceptancePolicy::Exact`].
pub const EXACT_MATCH: f64 = 1.0;

/// When a best candidate counts as a confirmed identity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum AcceptancePolicy {
    /// Only an exact embedding match (similarity == 1.0) is confirmed.
    /// Any sensor noise at all falls below this; see DESIGN.md.
    #[default]
    Exact,
    /// Calibrated threshold: similarity >= the given value is confirmed.
    AtLeast(f64),
}

impl AcceptancePolicy {
    pub fn accepts(&self, similarity: f64) -> bool {
        match *self {
            AcceptancePolicy::Exact => similarity == EXACT_MATCH,
            AcceptancePolicy::AtLeast(t) => similarity >= t,
        }
    }
}

/// Outcome of re-ranking one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub position: usize,
    pub identity_id: String,
    pub similarity: f64,
    pub confirmed: bool,
}

/// Re-score `candidates` with exact cosine similarity against the stored
/// gallery embeddings and pick the best one.
///
/// The approximate index distance is ignored. Ties go to the lowest gallery
/// position. Returns `None` when there is nothing to score.
pub fn decide(
    query: &Embedding,
    candidates: &[Candidate],
    gallery: &Gallery,
    policy: AcceptancePolicy,
) -> Option<Decision> {
    let best = candidates
        .iter()
        .filter_map(|c| {
            let stored = gallery.embedding(c.position)?;
            let similarity = match_embedding(query, stored);
            log::debug!(
                "candidate {} approx distance {:.6} exact similarity {:.9}",
                c.position,
                c.distance,
                similarity
            );
            similarity.is_finite().then_some((c.position, similarity))
        })
        .fold(None, |acc, (position, similarity)| match acc {
            Some((best_pos, best_sim))
                if best_sim > similarity || (best_sim == similarity && best_pos < position) =>
            {
                Some((best_pos, best_sim))
            }
            _ => Some((position, similarity)),
        })?;

    let (position, similarity) = best;
    let identity_id = gallery.identity(position)?.to_string();
    Some(Decision {
        position,
        identity_id,
        similarity,
        confirmed: policy.accepts(similarity),
    })
}

pub fn match_embedding(query: &Embedding, stored: &[f32]) -> f64 {
    fingermatch_vision::fingerprint::match_embedding(query.as_slice(), stored)
}
