//! Scored id types shared by vector, keyword and hybrid search.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A document id with a relevance score. Higher is better.
///
/// The `score` semantics depend on the producer:
/// - **Vector search**: metric-dependent similarity (cosine similarity, dot product,
///   or `1 / (1 + euclidean)`)
/// - **Keyword search**: BM25 score
/// - **Hybrid search**: fused score (RRF or weighted combination)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredId {
    pub id: String,
    pub score: f32,
}

impl ScoredId {
    pub fn new(id: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            score,
        }
    }
}

/// A fused hybrid hit with the per-list components that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedHit {
    pub id: String,
    /// Combined score.
    pub score: f32,
    /// Score from the vector list, if the id appeared there.
    pub vector_score: Option<f32>,
    /// Score from the keyword list, if the id appeared there.
    pub keyword_score: Option<f32>,
}

/// Descending by score, then ascending by id for deterministic ties.
pub fn cmp_desc(a_score: f32, a_id: &str, b_score: f32, b_id: &str) -> Ordering {
    b_score
        .partial_cmp(&a_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a_id.cmp(b_id))
}
