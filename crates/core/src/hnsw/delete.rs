//! Node removal with eager neighbor-list repair, and arena compaction.
//!
//! A deleted node is tombstoned and unlinked from every list that pointed at it.
//! Each node that lost a link is reconnected through a local beam search seeded
//! from its surviving neighbors plus the deleted node's neighbors, so recall does
//! not degrade as deletes accumulate.

use crate::hnsw::graph::HnswIndex;
use crate::hnsw::insert::select_neighbors_heuristic;
use crate::hnsw::search::search_layer;
use crate::hnsw::visited::VisitedSet;
use std::collections::HashMap;

impl HnswIndex {
    /// Remove `id` from the index. Returns `false` if it was not present.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(slot) = self.id_to_slot.remove(id) else {
            return false;
        };
        let s = slot as usize;
        self.deleted[s] = true;
        let orphaned = std::mem::take(&mut self.neighbors[s]);

        // Unlink every incoming edge and remember who lost one, per layer.
        let mut affected: Vec<(u32, usize)> = Vec::new();
        for node in 0..self.neighbors.len() {
            if self.deleted[node] {
                continue;
            }
            for (layer, list) in self.neighbors[node].iter_mut().enumerate() {
                if let Some(pos) = list.iter().position(|&n| n == slot) {
                    list.remove(pos);
                    affected.push((node as u32, layer));
                }
            }
        }

        if self.entry_point == Some(slot) {
            self.reassign_entry_point();
        }

        let mut visited = VisitedSet::new(self.slot_count());
        for (node, layer) in affected {
            let seeds = orphaned.get(layer).map(Vec::as_slice).unwrap_or(&[]);
            self.repair(node, layer, seeds, &mut visited);
        }

        tracing::trace!(id, slot, "hnsw node deleted");
        true
    }

    /// Reconnect `node` at `layer` after it lost a neighbor.
    fn repair(&mut self, node: u32, layer: usize, seeds: &[u32], visited: &mut VisitedSet) {
        let mut entry: Vec<u32> = self.neighbors[node as usize][layer].clone();
        entry.extend(seeds.iter().copied().filter(|&n| n != node && !self.is_deleted(n)));
        if entry.is_empty() {
            return;
        }

        let not_self = |slot: u32| slot != node;
        let found = search_layer(
            self,
            self.vector(node),
            &entry,
            self.config.ef_construction,
            layer,
            visited,
            &not_self,
        );

        let mut candidates: Vec<(f32, u32)> = entry
            .iter()
            .filter(|&&n| n != node && !self.is_deleted(n))
            .map(|&n| (self.slot_distance(node, n), n))
            .collect();
        candidates.extend(found);
        let m_max = self.config.m_max(layer);
        let selected = select_neighbors_heuristic(self, &candidates, m_max);
        self.neighbors[node as usize][layer] = selected.iter().map(|&(_, n)| n).collect();

        // Offer a back link where the new neighbor still has room.
        for &(_, n) in &selected {
            let list = match self.neighbors[n as usize].get_mut(layer) {
                Some(list) => list,
                None => continue,
            };
            if list.len() < m_max && !list.contains(&node) {
                list.push(node);
            }
        }
    }

    /// Move the entry point to the live node with the highest layer.
    fn reassign_entry_point(&mut self) {
        let best = (0..self.layers.len())
            .filter(|&s| !self.deleted[s])
            .max_by(|&a, &b| self.layers[a].cmp(&self.layers[b]).then_with(|| b.cmp(&a)));
        match best {
            Some(s) => {
                self.entry_point = Some(s as u32);
                self.max_layer = self.layers[s] as usize;
            }
            None => {
                self.entry_point = None;
                self.max_layer = 0;
            }
        }
    }

    /// Rebuild the arena without tombstoned slots. Live nodes keep their
    /// relative order and links; returns the number of slots reclaimed.
    pub fn compact(&mut self) -> usize {
        let reclaimed = self.tombstones();
        if reclaimed == 0 {
            return 0;
        }

        let remap: HashMap<u32, u32> = (0..self.slot_count() as u32)
            .filter(|&s| !self.is_deleted(s))
            .enumerate()
            .map(|(new, old)| (old, new as u32))
            .collect();

        let live = self.len();
        let mut vectors = Vec::with_capacity(live * self.dimension);
        let mut neighbors = Vec::with_capacity(live);
        let mut layers = Vec::with_capacity(live);
        let mut slot_ids = Vec::with_capacity(live);
        for old in 0..self.slot_count() as u32 {
            if self.is_deleted(old) {
                continue;
            }
            let o = old as usize;
            vectors.extend_from_slice(self.vector(old));
            neighbors.push(
                self.neighbors[o]
                    .iter()
                    .map(|list| list.iter().filter_map(|n| remap.get(n).copied()).collect())
                    .collect::<Vec<Vec<u32>>>(),
            );
            layers.push(self.layers[o]);
            slot_ids.push(std::mem::take(&mut self.slot_ids[o]));
        }

        self.vectors = vectors;
        self.neighbors = neighbors;
        self.layers = layers;
        self.deleted = vec![false; live];
        self.id_to_slot = slot_ids
            .iter()
            .enumerate()
            .map(|(slot, id)| (id.clone(), slot as u32))
            .collect();
        self.slot_ids = slot_ids;
        self.entry_point = self.entry_point.and_then(|ep| remap.get(&ep).copied());
        tracing::debug!(reclaimed, live, "hnsw arena compacted");
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use crate::hnsw::graph::HnswIndex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn build(n: usize, dim: usize) -> (HnswIndex, Vec<Vec<f32>>) {
        let mut rng = StdRng::seed_from_u64(11);
        let vectors: Vec<Vec<f32>> = (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();
        let mut index = HnswIndex::with_default_config(dim);
        for (i, v) in vectors.iter().enumerate() {
            index.insert(format!("{i}"), v).unwrap();
        }
        (index, vectors)
    }

    #[test]
    fn test_delete_removes_from_results() {
        let (mut index, vectors) = build(50, 8);
        assert!(index.delete("7"));
        assert!(!index.delete("7"));
        assert_eq!(index.len(), 49);
        let hits = index.search(&vectors[7], 10, None).unwrap();
        assert!(hits.iter().all(|(id, _)| id != "7"));
    }

    #[test]
    fn test_no_dangling_links_after_delete() {
        let (mut index, _) = build(120, 8);
        for i in (0..120).step_by(3) {
            index.delete(&i.to_string());
        }
        for (slot, per_layer) in index.neighbors.iter().enumerate() {
            if index.deleted[slot] {
                assert!(per_layer.is_empty());
                continue;
            }
            for list in per_layer {
                assert!(list.iter().all(|&n| !index.deleted[n as usize]));
            }
        }
    }

    #[test]
    fn test_recall_survives_many_deletes() {
        let (mut index, vectors) = build(300, 12);
        for i in 0..150 {
            index.delete(&(i * 2).to_string());
        }
        // Every surviving node must still find itself.
        let mut found = 0;
        for i in (1..300).step_by(2) {
            let hits = index.search(&vectors[i], 1, Some(64)).unwrap();
            if hits.first().map(|(id, _)| id.as_str()) == Some(&i.to_string()) {
                found += 1;
            }
        }
        assert!(found >= 145, "self-recall {found}/150");
    }

    #[test]
    fn test_entry_point_moves_to_live_node() {
        let (mut index, _) = build(40, 4);
        let ep = index.entry_point_id().unwrap().to_string();
        index.delete(&ep);
        let new_ep = index.entry_point.unwrap();
        assert!(!index.deleted[new_ep as usize]);
        assert_eq!(index.layers[new_ep as usize] as usize, index.max_layer);
    }

    #[test]
    fn test_delete_everything_then_reinsert() {
        let (mut index, _) = build(10, 3);
        for i in 0..10 {
            index.delete(&i.to_string());
        }
        assert!(index.is_empty());
        assert!(index.entry_point.is_none());
        index.insert("fresh", &[1.0, 0.0, 0.0]).unwrap();
        let hits = index.search(&[1.0, 0.0, 0.0], 3, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "fresh");
    }

    #[test]
    fn test_compact_preserves_search() {
        let (mut index, vectors) = build(80, 6);
        for i in 0..20 {
            index.delete(&i.to_string());
        }
        let before = index.search(&vectors[40], 5, None).unwrap();
        assert_eq!(index.compact(), 20);
        assert_eq!(index.slot_count(), 60);
        assert_eq!(index.tombstones(), 0);
        let after = index.search(&vectors[40], 5, None).unwrap();
        assert_eq!(before, after);
        assert_eq!(index.compact(), 0);
    }
}
