//! HNSW search algorithms: single-layer search and multi-layer KNN.
//!
//! Supports optional pre-filtering via a predicate applied during graph
//! traversal. Filtered nodes are still used for navigation but excluded from results.
//! Heap ordering breaks distance ties by slot so traversal is deterministic.

use crate::error::VectorError;
use crate::hnsw::distance::validate_vector;
use crate::hnsw::graph::HnswIndex;
use crate::hnsw::visited::VisitedSet;
use ordered_float::OrderedFloat;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

thread_local! {
    /// Thread-local VisitedSet pool for search operations.
    static SEARCH_VISITED: RefCell<VisitedSet> = RefCell::new(VisitedSet::default());
}

/// A candidate during search. Max-heap on negated distance pops the closest first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    neg_distance: OrderedFloat<f32>,
    slot: u32,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.neg_distance
            .cmp(&other.neg_distance)
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A result entry. Max-heap by distance so the worst result sits on top for pruning.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResultEntry {
    distance: OrderedFloat<f32>,
    slot: u32,
}

impl Ord for ResultEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

impl PartialOrd for ResultEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Search a single layer of the HNSW graph.
/// Returns up to `ef` closest live nodes accepted by `filter_fn`, ascending by distance.
pub(crate) fn search_layer<F: Fn(u32) -> bool>(
    index: &HnswIndex,
    query: &[f32],
    entry_points: &[u32],
    ef: usize,
    layer: usize,
    visited: &mut VisitedSet,
    filter_fn: &F,
) -> Vec<(f32, u32)> {
    visited.reset(index.slot_count());
    let metric = index.config.metric;
    let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<ResultEntry> = BinaryHeap::with_capacity(ef + 1);
    // Cached worst distance, avoids repeated heap peeks in the hot loop
    let mut worst_dist = f32::MAX;

    for &ep in entry_points {
        if !visited.insert(ep) {
            continue;
        }
        let dist = metric.distance(query, index.vector(ep));
        candidates.push(Candidate {
            neg_distance: OrderedFloat(-dist),
            slot: ep,
        });
        if !index.is_deleted(ep) && filter_fn(ep) {
            results.push(ResultEntry {
                distance: OrderedFloat(dist),
                slot: ep,
            });
            if results.len() > ef {
                results.pop();
            }
            if results.len() >= ef {
                worst_dist = results.peek().map_or(f32::MAX, |r| r.distance.0);
            }
        }
    }

    while let Some(candidate) = candidates.pop() {
        let c_dist = -candidate.neg_distance.0;

        // Closest remaining candidate is farther than the worst kept result
        if results.len() >= ef && c_dist > worst_dist {
            break;
        }

        let Some(neighbor_list) = index.neighbors[candidate.slot as usize].get(layer) else {
            continue;
        };

        for &neighbor in neighbor_list {
            if !visited.insert(neighbor) {
                continue;
            }

            let dist = metric.distance(query, index.vector(neighbor));
            if results.len() < ef || dist < worst_dist {
                candidates.push(Candidate {
                    neg_distance: OrderedFloat(-dist),
                    slot: neighbor,
                });
                if !index.is_deleted(neighbor) && filter_fn(neighbor) {
                    results.push(ResultEntry {
                        distance: OrderedFloat(dist),
                        slot: neighbor,
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                    if results.len() >= ef {
                        worst_dist = results.peek().map_or(f32::MAX, |r| r.distance.0);
                    }
                }
            }
        }
    }

    results
        .into_sorted_vec()
        .into_iter()
        .map(|r| (r.distance.0, r.slot))
        .collect()
}

/// Greedy descent from the entry point down to `target_layer + 1`.
pub(crate) fn descend(
    index: &HnswIndex,
    query: &[f32],
    entry_point: u32,
    target_layer: usize,
    visited: &mut VisitedSet,
) -> u32 {
    let mut current = entry_point;
    let no_filter = |_: u32| true;
    for layer in (target_layer + 1..=index.max_layer).rev() {
        let results = search_layer(
            index,
            query,
            std::slice::from_ref(&current),
            1,
            layer,
            visited,
            &no_filter,
        );
        if let Some(&(_, nearest)) = results.first() {
            current = nearest;
        }
    }
    current
}

/// Multi-layer KNN search with a filter predicate applied during layer-0 traversal.
/// Uses adaptive ef oversampling: if the initial search yields fewer than k results,
/// retries with progressively larger ef (up to 4×) to handle low-selectivity filters.
pub(crate) fn knn_search_filtered<F: Fn(u32) -> bool>(
    index: &HnswIndex,
    query: &[f32],
    k: usize,
    ef: Option<usize>,
    filter_fn: &F,
) -> Vec<(f32, u32)> {
    let Some(entry_point) = index.entry_point else {
        return Vec::new();
    };
    if k == 0 {
        return Vec::new();
    }

    SEARCH_VISITED.with(|cell| {
        let mut visited = cell.borrow_mut();
        let current_ep = descend(index, query, entry_point, 0, &mut visited);

        let base_ef = ef.unwrap_or(index.config.ef_search).max(k);
        let max_ef = (base_ef * 4).min(index.slot_count()).max(base_ef);
        let mut ef = base_ef;
        let mut results;

        loop {
            results = search_layer(
                index,
                query,
                std::slice::from_ref(&current_ep),
                ef,
                0,
                &mut visited,
                filter_fn,
            );
            if results.len() >= k || ef >= max_ef {
                break;
            }
            ef = (ef * 2).min(max_ef);
        }

        results.truncate(k);
        results
    })
}

impl HnswIndex {
    /// Approximate k nearest neighbors of `query` as `(id, distance)`, ascending by
    /// distance with ties broken by id. `ef` defaults to `max(ef_search, k)`.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
    ) -> Result<Vec<(String, f32)>, VectorError> {
        self.search_filtered(query, k, ef, |_| true)
    }

    /// Like [`HnswIndex::search`] but only ids accepted by `predicate` are returned.
    /// Rejected nodes are still traversed so the graph stays navigable.
    pub fn search_filtered<P>(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        predicate: P,
    ) -> Result<Vec<(String, f32)>, VectorError>
    where
        P: Fn(&str) -> bool,
    {
        validate_vector(query, self.dimension)?;
        let filter_fn = |slot: u32| predicate(&self.slot_ids[slot as usize]);
        let raw = knn_search_filtered(self, query, k, ef, &filter_fn);
        let mut hits: Vec<(String, f32)> = raw
            .into_iter()
            .map(|(dist, slot)| (self.slot_ids[slot as usize].clone(), dist))
            .collect();
        hits.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(hits)
    }
}
