//! BM25 Okapi scoring engine.
//!
//! Scores documents against a query using the BM25 formula with configurable
//! `k1` and `b` parameters (defaults in [`crate::config`]).

use crate::bm25::inverted_index::InvertedIndex;
use crate::config;
use crate::search::types::{cmp_desc, ScoredId};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

/// BM25 tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f32,
    /// Length-normalization strength in \[0, 1\].
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: config::BM25_K1,
            b: config::BM25_B,
        }
    }
}

/// IDF: ln((N - df + 0.5) / (df + 0.5) + 1). Always positive.
pub fn idf(n: usize, df: usize) -> f32 {
    let n = n as f32;
    let df = df as f32;
    ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
}

/// BM25 Okapi scoring for the given query terms against the inverted index.
/// Returns the top `k` documents with a positive score, descending, ties by id.
pub fn bm25_search(
    index: &InvertedIndex,
    query_terms: &[String],
    params: &Bm25Params,
    k: usize,
) -> Vec<ScoredId> {
    if query_terms.is_empty() || index.document_count() == 0 || k == 0 {
        return Vec::new();
    }

    let avgdl = index.average_doc_length().max(f32::EPSILON);
    let n = index.document_count();
    let unique: BTreeSet<&str> = query_terms.iter().map(String::as_str).collect();

    let mut scores: HashMap<&str, f32> = HashMap::with_capacity(256.min(n));
    for term in unique {
        let Some(ids) = index.postings.get(term) else {
            continue;
        };
        let term_idf = idf(n, ids.len());
        for id in ids {
            let Some(doc) = index.documents.get(id) else {
                continue;
            };
            let tf = doc.term_frequencies.get(term).copied().unwrap_or(0) as f32;
            let dl = doc.length as f32;
            let tf_norm =
                (tf * (params.k1 + 1.0)) / (tf + params.k1 * (1.0 - params.b + params.b * dl / avgdl));
            *scores.entry(id.as_str()).or_insert(0.0) += term_idf * tf_norm;
        }
    }

    // Partial sort: O(n log k) via min-heap of size k; the popped entry is the
    // lowest score, or the largest id among equal scores.
    let mut heap: BinaryHeap<Reverse<(OrderedFloat<f32>, Reverse<&str>)>> =
        BinaryHeap::with_capacity(k + 1);
    for (id, score) in scores {
        if score <= 0.0 {
            continue;
        }
        heap.push(Reverse((OrderedFloat(score), Reverse(id))));
        if heap.len() > k {
            heap.pop();
        }
    }
    let mut results: Vec<ScoredId> = heap
        .into_iter()
        .map(|Reverse((s, Reverse(id)))| ScoredId::new(id, s.0))
        .collect();
    results.sort_unstable_by(|a, b| cmp_desc(a.score, &a.id, b.score, &b.id));
    results
}
