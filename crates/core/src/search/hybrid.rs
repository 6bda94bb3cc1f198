//! Hybrid search fusion strategies.
//!
//! Combines vector search and keyword search results into a single ranked list.
//! Two strategies are available:
//! - **RRF** (Reciprocal Rank Fusion): rank-based, robust to differing score scales
//! - **Weighted**: score-based combination with optional min-max normalization
//!
//! Both return the full fused list sorted by descending score (ties by id);
//! `k` truncation and minimum-score thresholds are applied by the caller.

use crate::config;
use crate::search::types::{cmp_desc, FusedHit, ScoredId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parameters for weighted fusion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedFusion {
    pub vector_weight: f32,
    pub keyword_weight: f32,
    /// Min-max normalize each list to \[0, 1\] before combining.
    pub normalize: bool,
}

impl Default for WeightedFusion {
    fn default() -> Self {
        Self {
            vector_weight: config::HYBRID_DEFAULT_VECTOR_WEIGHT,
            keyword_weight: config::HYBRID_DEFAULT_KEYWORD_WEIGHT,
            normalize: true,
        }
    }
}

/// Fusion strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FusionMethod {
    /// Reciprocal Rank Fusion with constant `k`.
    Rrf { k: f32 },
    /// Weighted score combination.
    Weighted(WeightedFusion),
}

impl Default for FusionMethod {
    fn default() -> Self {
        FusionMethod::Rrf { k: config::RRF_K }
    }
}

impl FusionMethod {
    /// Fuse the two lists with this strategy.
    pub fn fuse(&self, vector_results: &[ScoredId], keyword_results: &[ScoredId]) -> Vec<FusedHit> {
        match self {
            FusionMethod::Rrf { k } => rrf_fusion(vector_results, keyword_results, *k),
            FusionMethod::Weighted(params) => {
                weighted_fusion(vector_results, keyword_results, params)
            }
        }
    }
}

#[derive(Default)]
struct Accumulator {
    score: f32,
    vector_score: Option<f32>,
    keyword_score: Option<f32>,
}

/// Reciprocal Rank Fusion: combines ranked lists.
/// score(d) = Σ 1 / (k + rank_i(d)), rank 1-based; absent ⇒ contributes 0.
pub fn rrf_fusion(
    vector_results: &[ScoredId],
    keyword_results: &[ScoredId],
    rrf_k: f32,
) -> Vec<FusedHit> {
    let mut scores: HashMap<&str, Accumulator> =
        HashMap::with_capacity(vector_results.len() + keyword_results.len());

    for (rank, hit) in vector_results.iter().enumerate() {
        let acc = scores.entry(hit.id.as_str()).or_default();
        acc.score += 1.0 / (rrf_k + rank as f32 + 1.0);
        acc.vector_score = Some(hit.score);
    }
    for (rank, hit) in keyword_results.iter().enumerate() {
        let acc = scores.entry(hit.id.as_str()).or_default();
        acc.score += 1.0 / (rrf_k + rank as f32 + 1.0);
        acc.keyword_score = Some(hit.score);
    }

    finish(scores)
}

/// Weighted combination with optional min-max normalization.
/// score(d) = vector_weight · v(d) + keyword_weight · kw(d); absent ⇒ 0.
pub fn weighted_fusion(
    vector_results: &[ScoredId],
    keyword_results: &[ScoredId],
    params: &WeightedFusion,
) -> Vec<FusedHit> {
    let mut scores: HashMap<&str, Accumulator> =
        HashMap::with_capacity(vector_results.len() + keyword_results.len());

    let normalizer = |results: &[ScoredId]| -> Option<(f32, f32)> {
        if params.normalize {
            min_max(results)
        } else {
            None
        }
    };

    let vector_norm = normalizer(vector_results);
    for hit in vector_results {
        let acc = scores.entry(hit.id.as_str()).or_default();
        acc.score += params.vector_weight * scale(hit.score, vector_norm);
        acc.vector_score = Some(hit.score);
    }

    let keyword_norm = normalizer(keyword_results);
    for hit in keyword_results {
        let acc = scores.entry(hit.id.as_str()).or_default();
        acc.score += params.keyword_weight * scale(hit.score, keyword_norm);
        acc.keyword_score = Some(hit.score);
    }

    finish(scores)
}

fn scale(score: f32, bounds: Option<(f32, f32)>) -> f32 {
    match bounds {
        None => score,
        Some((min, max)) => {
            let range = max - min;
            if range < f32::EPSILON {
                1.0
            } else {
                (score - min) / range
            }
        }
    }
}

fn finish(scores: HashMap<&str, Accumulator>) -> Vec<FusedHit> {
    let mut fused: Vec<FusedHit> = scores
        .into_iter()
        .map(|(id, acc)| FusedHit {
            id: id.to_string(),
            score: acc.score,
            vector_score: acc.vector_score,
            keyword_score: acc.keyword_score,
        })
        .collect();
    fused.sort_unstable_by(|a, b| cmp_desc(a.score, &a.id, b.score, &b.id));
    fused
}

/// Single-pass min/max computation.
fn min_max(results: &[ScoredId]) -> Option<(f32, f32)> {
    if results.is_empty() {
        return None;
    }
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for hit in results {
        min = min.min(hit.score);
        max = max.max(hit.score);
    }
    Some((min, max))
}
