//! HNSW insertion algorithm.
//!
//! Inserts a vector into the HNSW graph with bidirectional connections and
//! heuristic neighbor pruning (Algorithm 4 from the HNSW paper).

use crate::error::VectorError;
use crate::hnsw::distance::validate_vector;
use crate::hnsw::graph::HnswIndex;
use crate::hnsw::search::{descend, search_layer};
use crate::hnsw::visited::VisitedSet;
use std::collections::HashSet;

impl HnswIndex {
    /// Insert or replace the vector stored under `id`.
    ///
    /// Re-inserting a live id removes the old node (repairing its neighbors)
    /// before the new one is linked in.
    pub fn insert(&mut self, id: impl Into<String>, vector: &[f32]) -> Result<(), VectorError> {
        validate_vector(vector, self.dimension)?;
        let id = id.into();
        if self.contains(&id) {
            self.delete(&id);
        }

        let level = self.random_level();

        // First live node: nothing to link against
        let Some(entry_point) = self.entry_point else {
            let slot = self.push_slot(id, vector, level);
            self.entry_point = Some(slot);
            self.max_layer = level;
            return Ok(());
        };

        let mut visited = VisitedSet::new(self.slot_count());

        // Phase 1: greedy descent from the top layer down to level + 1
        let current_ep = descend(self, vector, entry_point, level, &mut visited);

        // Phase 2: beam search each layer from min(level, max_layer) down to 0
        let top = level.min(self.max_layer);
        let mut node_neighbors: Vec<Vec<u32>> = vec![Vec::new(); level + 1];
        let no_filter = |_: u32| true;
        let mut layer_eps: Vec<u32> = vec![current_ep];
        for layer in (0..=top).rev() {
            let candidates = search_layer(
                self,
                vector,
                &layer_eps,
                self.config.ef_construction,
                layer,
                &mut visited,
                &no_filter,
            );

            let selected = select_neighbors_heuristic(self, &candidates, self.config.m_max(layer));
            node_neighbors[layer] = selected.iter().map(|&(_, slot)| slot).collect();

            layer_eps.clear();
            layer_eps.extend(candidates.iter().map(|&(_, slot)| slot));
            if layer_eps.is_empty() {
                layer_eps.push(entry_point);
            }
        }

        let slot = self.push_slot(id, vector, level);
        self.neighbors[slot as usize] = node_neighbors;

        // Phase 3: bidirectional connections, pruning over-capacity neighbors
        for layer in 0..=top {
            let m_max = self.config.m_max(layer);
            let my_neighbors = self.neighbors[slot as usize][layer].clone();
            for neighbor in my_neighbors {
                let n = neighbor as usize;
                if self.neighbors[n].len() <= layer {
                    self.neighbors[n].resize(layer + 1, Vec::new());
                }
                self.neighbors[n][layer].push(slot);

                if self.neighbors[n][layer].len() > m_max {
                    let candidates: Vec<(f32, u32)> = self.neighbors[n][layer]
                        .iter()
                        .map(|&c| (self.slot_distance(neighbor, c), c))
                        .collect();
                    let pruned = select_neighbors_heuristic(self, &candidates, m_max);
                    self.neighbors[n][layer] = pruned.iter().map(|&(_, c)| c).collect();
                }
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(slot);
        }
        Ok(())
    }
}

/// Heuristic neighbor selection (Algorithm 4 from the HNSW paper).
/// A candidate is selected only if it is closer to the base node than to any
/// already-selected neighbor; remaining slots are filled with the closest leftovers.
pub(crate) fn select_neighbors_heuristic(
    index: &HnswIndex,
    candidates: &[(f32, u32)],
    m: usize,
) -> Vec<(f32, u32)> {
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    sorted.dedup_by_key(|c| c.1);

    let mut selected: Vec<(f32, u32)> = Vec::with_capacity(m);
    for &(dist_to_base, cid) in &sorted {
        if selected.len() >= m {
            break;
        }
        let is_diverse = selected
            .iter()
            .all(|&(_, sid)| dist_to_base <= index.slot_distance(cid, sid));
        if is_diverse {
            selected.push((dist_to_base, cid));
        }
    }

    if selected.len() < m {
        let chosen: HashSet<u32> = selected.iter().map(|&(_, id)| id).collect();
        for &(dist, cid) in &sorted {
            if selected.len() >= m {
                break;
            }
            if !chosen.contains(&cid) {
                selected.push((dist, cid));
            }
        }
    }

    selected
}
