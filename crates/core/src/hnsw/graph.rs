//! HNSW graph structure and configuration.
//!
//! [`HnswConfig`] defines tuning parameters (M, ef_construction, ef_search, distance metric).
//! [`HnswIndex`] stores the graph using Struct-of-Arrays layout for cache efficiency.
//! Callers address nodes by their string id; the graph itself works on dense
//! `u32` slots that are never reused until [`HnswIndex::compact`] runs.

use crate::config;
use crate::hnsw::distance::DistanceMetric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration parameters for an HNSW index.
///
/// Controls the trade-off between build speed, search speed and recall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Number of bidirectional links per node (except layer 0, which uses `m_max0`).
    pub m: usize,
    /// Maximum links per node at layer 0 (typically `2 * m`).
    pub m_max0: usize,
    /// Candidate list size during index construction.
    pub ef_construction: usize,
    /// Candidate list size during search (higher = better recall, slower).
    pub ef_search: usize,
    /// Maximum number of layers in the graph.
    pub max_layers: usize,
    /// Distance function for similarity computation.
    pub metric: DistanceMetric,
    /// Seed for level assignment, so identical insert sequences build identical graphs.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    config::HNSW_DEFAULT_SEED
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: config::HNSW_DEFAULT_M,
            m_max0: config::HNSW_DEFAULT_M * 2,
            ef_construction: config::HNSW_DEFAULT_EF_CONSTRUCTION,
            ef_search: config::HNSW_DEFAULT_EF_SEARCH,
            max_layers: config::HNSW_DEFAULT_MAX_LAYERS,
            metric: DistanceMetric::Cosine,
            seed: config::HNSW_DEFAULT_SEED,
        }
    }
}

impl HnswConfig {
    /// Default configuration with the given metric.
    pub fn with_metric(metric: DistanceMetric) -> Self {
        Self {
            metric,
            ..Self::default()
        }
    }

    /// Neighbor capacity at `layer`.
    #[inline]
    pub fn m_max(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m_max0
        } else {
            self.m
        }
    }
}

/// HNSW index using Struct-of-Arrays (SoA) layout.
/// Vector data is stored contiguously in an f32 arena indexed by slot.
#[derive(Debug, Clone)]
pub struct HnswIndex {
    pub(crate) config: HnswConfig,
    pub(crate) dimension: usize,
    // SoA: vector arena, `dimension` floats per slot
    pub(crate) vectors: Vec<f32>,
    // SoA: graph structure
    pub(crate) neighbors: Vec<Vec<Vec<u32>>>, // [slot][layer][neighbor slots]
    pub(crate) layers: Vec<u8>,
    pub(crate) deleted: Vec<bool>,
    // External id mapping
    pub(crate) slot_ids: Vec<String>,
    pub(crate) id_to_slot: HashMap<String, u32>,
    // Index metadata
    pub(crate) entry_point: Option<u32>,
    pub(crate) max_layer: usize,
    pub(crate) rng: StdRng,
    /// Values drawn from `rng` so far; persisted so a restored index
    /// continues the same level sequence.
    pub(crate) level_draws: u64,
}

impl HnswIndex {
    /// Creates a new empty HNSW index with the given dimension and configuration.
    pub fn new(dimension: usize, config: HnswConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            dimension,
            vectors: Vec::new(),
            neighbors: Vec::new(),
            layers: Vec::new(),
            deleted: Vec::new(),
            slot_ids: Vec::new(),
            id_to_slot: HashMap::new(),
            entry_point: None,
            max_layer: 0,
            rng,
            level_draws: 0,
        }
    }

    /// Creates a new empty HNSW index with default configuration (cosine, M=16, ef_c=200).
    pub fn with_default_config(dimension: usize) -> Self {
        Self::new(dimension, HnswConfig::default())
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.config.metric
    }

    /// Returns the number of live (non-deleted) nodes in the index.
    pub fn len(&self) -> usize {
        self.id_to_slot.len()
    }

    /// Returns `true` if the index contains no live nodes.
    pub fn is_empty(&self) -> bool {
        self.id_to_slot.is_empty()
    }

    /// Total slots including tombstones.
    pub fn slot_count(&self) -> usize {
        self.layers.len()
    }

    /// Number of tombstoned slots awaiting [`HnswIndex::compact`].
    pub fn tombstones(&self) -> usize {
        self.slot_count() - self.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.id_to_slot.contains_key(id)
    }

    /// Stored vector for a live id.
    pub fn get_vector(&self, id: &str) -> Option<&[f32]> {
        self.id_to_slot.get(id).map(|&slot| self.vector(slot))
    }

    /// Live ids in insertion (slot) order.
    pub fn ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.slot_ids
            .iter()
            .enumerate()
            .filter(|(slot, _)| !self.deleted[*slot])
            .map(|(_, id)| id.as_str())
    }

    /// Id of the current entry point, if any.
    pub fn entry_point_id(&self) -> Option<&str> {
        self.entry_point.map(|slot| self.slot_ids[slot as usize].as_str())
    }

    /// Highest populated layer.
    pub fn max_layer(&self) -> usize {
        self.max_layer
    }

    /// Generate a random layer for a new node using exponential distribution.
    pub(crate) fn random_level(&mut self) -> usize {
        let ml = 1.0 / (self.config.m.max(2) as f64).ln();
        // gen::<f64>() is in [0, 1); shift to (0, 1] so ln() stays finite.
        let r: f64 = 1.0 - self.rng.gen::<f64>();
        self.level_draws += 1;
        let level = (-r.ln() * ml).floor() as usize;
        level.min(self.config.max_layers.saturating_sub(1))
    }

    /// Reseed the level generator and fast-forward it past `draws` values.
    pub(crate) fn resume_levels(&mut self, seed: u64, draws: u64) {
        self.config.seed = seed;
        self.rng = StdRng::seed_from_u64(seed);
        for _ in 0..draws {
            let _: f64 = self.rng.gen();
        }
        self.level_draws = draws;
    }

    /// Slice of the arena holding `slot`'s vector.
    #[inline]
    pub(crate) fn vector(&self, slot: u32) -> &[f32] {
        let start = slot as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    #[inline]
    pub(crate) fn is_deleted(&self, slot: u32) -> bool {
        self.deleted[slot as usize]
    }

    #[inline]
    pub(crate) fn slot_distance(&self, a: u32, b: u32) -> f32 {
        self.config.metric.distance(self.vector(a), self.vector(b))
    }

    /// Appends a fresh slot with empty neighbor lists up to `level`.
    pub(crate) fn push_slot(&mut self, id: String, vector: &[f32], level: usize) -> u32 {
        let slot = self.layers.len() as u32;
        self.vectors.extend_from_slice(vector);
        self.neighbors.push(vec![Vec::new(); level + 1]);
        self.layers.push(level as u8);
        self.deleted.push(false);
        self.id_to_slot.insert(id.clone(), slot);
        self.slot_ids.push(id);
        slot
    }
}
