//! Portable serialized form of the HNSW graph.
//!
//! Nodes are emitted in insertion order with tombstones skipped, and neighbor
//! lists are written as external ids so the blob does not depend on slot layout.

use crate::error::VectorError;
use crate::hnsw::distance::{validate_vector, DistanceMetric};
use crate::hnsw::graph::{HnswConfig, HnswIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedIndex {
    pub dimensions: usize,
    pub node_count: usize,
    #[serde(rename = "M")]
    pub m: usize,
    pub ef_construction: usize,
    #[serde(default)]
    pub ef_search: Option<usize>,
    pub entry_point_id: Option<String>,
    #[serde(default)]
    pub metric: DistanceMetric,
    pub nodes: Vec<SerializedNode>,
    /// Level generator seed and how many levels it has produced.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub level_draws: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedNode {
    pub id: String,
    pub vector: Vec<f32>,
    /// Neighbor ids per layer, layer 0 first.
    pub layers: Vec<Vec<String>>,
}

impl HnswIndex {
    pub fn to_serialized(&self) -> SerializedIndex {
        let nodes = (0..self.slot_count() as u32)
            .filter(|&slot| !self.is_deleted(slot))
            .map(|slot| SerializedNode {
                id: self.slot_ids[slot as usize].clone(),
                vector: self.vector(slot).to_vec(),
                layers: self.neighbors[slot as usize]
                    .iter()
                    .map(|list| {
                        list.iter()
                            .map(|&n| self.slot_ids[n as usize].clone())
                            .collect()
                    })
                    .collect(),
            })
            .collect();

        SerializedIndex {
            dimensions: self.dimension,
            node_count: self.len(),
            m: self.config.m,
            ef_construction: self.config.ef_construction,
            ef_search: Some(self.config.ef_search),
            entry_point_id: self.entry_point_id().map(str::to_string),
            metric: self.config.metric,
            nodes,
            seed: Some(self.config.seed),
            level_draws: self.level_draws,
        }
    }

    /// Rebuild an index from its serialized form, validating every reference.
    pub fn from_serialized(data: SerializedIndex) -> Result<Self, VectorError> {
        let invalid = |msg: String| VectorError::InvalidSnapshot(msg);

        if data.node_count != data.nodes.len() {
            return Err(invalid(format!(
                "nodeCount {} but {} nodes present",
                data.node_count,
                data.nodes.len()
            )));
        }

        let defaults = HnswConfig::default();
        let config = HnswConfig {
            m: data.m,
            m_max0: data.m * 2,
            ef_construction: data.ef_construction,
            ef_search: data.ef_search.unwrap_or(defaults.ef_search),
            metric: data.metric,
            ..defaults
        };
        let mut index = HnswIndex::new(data.dimensions, config);

        for node in &data.nodes {
            validate_vector(&node.vector, data.dimensions)?;
            if node.layers.is_empty() || node.layers.len() > index.config.max_layers {
                return Err(invalid(format!(
                    "node {} has {} layers",
                    node.id,
                    node.layers.len()
                )));
            }
            if index.contains(&node.id) {
                return Err(invalid(format!("duplicate node id {}", node.id)));
            }
            index.push_slot(node.id.clone(), &node.vector, node.layers.len() - 1);
        }

        let lookup: HashMap<&str, u32> = data
            .nodes
            .iter()
            .enumerate()
            .map(|(slot, node)| (node.id.as_str(), slot as u32))
            .collect();

        for (slot, node) in data.nodes.iter().enumerate() {
            let mut per_layer = Vec::with_capacity(node.layers.len());
            for list in &node.layers {
                let mut resolved = Vec::with_capacity(list.len());
                for neighbor in list {
                    let Some(&n) = lookup.get(neighbor.as_str()) else {
                        return Err(invalid(format!(
                            "node {} links unknown neighbor {neighbor}",
                            node.id
                        )));
                    };
                    resolved.push(n);
                }
                per_layer.push(resolved);
            }
            index.neighbors[slot] = per_layer;
        }

        match data.entry_point_id {
            Some(ep) => {
                let Some(&slot) = lookup.get(ep.as_str()) else {
                    return Err(invalid(format!("entry point {ep} not found")));
                };
                index.entry_point = Some(slot);
                index.max_layer = index.layers[slot as usize] as usize;
            }
            None if !data.nodes.is_empty() => {
                return Err(invalid("missing entry point".to_string()));
            }
            None => {}
        }

        let seed = data.seed.unwrap_or(index.config.seed);
        index.resume_levels(seed, data.level_draws);
        Ok(index)
    }

    pub fn to_json(&self) -> Result<String, VectorError> {
        serde_json::to_string(&self.to_serialized())
            .map_err(|e| VectorError::InvalidSnapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, VectorError> {
        let data: SerializedIndex =
            serde_json::from_str(json).map_err(|e| VectorError::InvalidSnapshot(e.to_string()))?;
        Self::from_serialized(data)
    }

    /// Compact binary form (bincode) used for index blobs in storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VectorError> {
        bincode::serialize(&self.to_serialized())
            .map_err(|e| VectorError::InvalidSnapshot(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VectorError> {
        let data: SerializedIndex =
            bincode::deserialize(bytes).map_err(|e| VectorError::InvalidSnapshot(e.to_string()))?;
        Self::from_serialized(data)
    }
}
