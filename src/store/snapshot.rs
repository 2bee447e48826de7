//! Dense snapshots of the graph at one point in time.
//!
//! A `GraphSnapshot` is the host-side view (index mapping, type indices,
//! content matrix, symmetric edge-weight matrix). `SnapshotTensors` is the
//! same data moved to the compute device.

use std::collections::{BTreeSet, HashMap};

use candle_core::{Device, Tensor};
use tracing::warn;

use super::models::{AttentionEdgeRecord, EntityRecord};

// ============================================================================
// Index mappings
// ============================================================================

/// Bijective mapping between entity ids and dense indices `0..N-1`.
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    ids: Vec<String>,
    positions: HashMap<String, usize>,
}

impl EntityIndex {
    /// Build from ids; duplicates keep their first position.
    pub fn from_ids<I: IntoIterator<Item = String>>(ids: I) -> Self {
        let mut index = Self::default();
        for id in ids {
            if !index.positions.contains_key(&id) {
                index.positions.insert(id.clone(), index.ids.len());
                index.ids.push(id);
            }
        }
        index
    }

    pub fn get(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn id(&self, index: usize) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Entity type strings mapped to embedding rows.
///
/// Row 0 is reserved for unknown types and for types beyond capacity.
#[derive(Debug, Clone, Default)]
pub struct TypeVocabulary {
    positions: HashMap<String, usize>,
}

impl TypeVocabulary {
    pub const UNKNOWN: usize = 0;

    /// Assign rows `1..capacity` to the sorted distinct types.
    pub fn build<'a, I: IntoIterator<Item = &'a str>>(types: I, capacity: usize) -> Self {
        let distinct: BTreeSet<&str> = types.into_iter().collect();
        let usable = capacity.saturating_sub(1);
        if distinct.len() > usable {
            warn!(
                "{} entity types exceed the vocabulary capacity of {}; overflow maps to unknown",
                distinct.len(),
                usable
            );
        }
        let positions = distinct
            .into_iter()
            .take(usable)
            .enumerate()
            .map(|(i, t)| (t.to_string(), i + 1))
            .collect();
        Self { positions }
    }

    pub fn get(&self, entity_type: &str) -> usize {
        self.positions
            .get(entity_type)
            .copied()
            .unwrap_or(Self::UNKNOWN)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Host-side dense view of one graph observation.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub index: EntityIndex,
    pub types: TypeVocabulary,
    /// Type row per entity, parallel to the index
    pub type_indices: Vec<u32>,
    /// `N × content_dim`, row-major, zeros where content is absent
    pub content: Vec<f32>,
    pub content_dim: usize,
    /// `N × N`, row-major, symmetric
    weights: Vec<f32>,
    /// Number of distinct undirected edges that made it into the matrix
    pub num_edges: usize,
}

impl GraphSnapshot {
    /// Build a snapshot from raw store records.
    ///
    /// Entities are de-duplicated by id and truncated to `max_entities` in
    /// listing order, then sorted by id so an unchanged entity set always
    /// maps to the same indices. Edge weights are clamped to [0, 1]; edges
    /// naming unknown entities, self loops and non-finite weights are dropped.
    pub fn build(
        entities: &[EntityRecord],
        edges: &[AttentionEdgeRecord],
        max_entities: usize,
        num_entity_types: usize,
        content_dim: usize,
    ) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut kept: Vec<&EntityRecord> = entities
            .iter()
            .filter(|e| seen.insert(e.id.as_str()))
            .collect();
        if kept.len() > max_entities {
            warn!(
                "Snapshot has {} entities, truncating to the configured maximum of {}",
                kept.len(),
                max_entities
            );
            kept.truncate(max_entities);
        }
        kept.sort_by(|a, b| a.id.cmp(&b.id));

        let index = EntityIndex::from_ids(kept.iter().map(|e| e.id.clone()));
        let types = TypeVocabulary::build(
            kept.iter().map(|e| e.entity_type.as_str()),
            num_entity_types,
        );
        let type_indices = kept
            .iter()
            .map(|e| types.get(&e.entity_type) as u32)
            .collect();

        let n = index.len();
        let mut content = vec![0.0f32; n * content_dim];
        let mut mismatched = 0usize;
        for (row, entity) in kept.iter().enumerate() {
            match entity.embedding.as_deref() {
                Some(v) if v.len() == content_dim => {
                    content[row * content_dim..(row + 1) * content_dim].copy_from_slice(v);
                }
                Some(_) => mismatched += 1,
                None => {}
            }
        }
        if mismatched > 0 {
            warn!(
                "{} entities carry content vectors of the wrong width (expected {}); using zeros",
                mismatched, content_dim
            );
        }

        let mut weights = vec![0.0f32; n * n];
        for edge in edges {
            if !edge.weight.is_finite() {
                continue;
            }
            let (Some(i), Some(j)) = (index.get(&edge.source), index.get(&edge.target)) else {
                continue;
            };
            if i == j {
                continue;
            }
            let w = edge.weight.clamp(0.0, 1.0);
            let current = weights[i * n + j];
            if w > current {
                weights[i * n + j] = w;
                weights[j * n + i] = w;
            }
        }
        let num_edges = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .filter(|&(i, j)| weights[i * n + j] > 0.0)
            .count();

        Self {
            index,
            types,
            type_indices,
            content,
            content_dim,
            weights,
            num_edges,
        }
    }

    pub fn num_entities(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Edge weight between two indices (0.0 for no edge).
    pub fn weight(&self, i: usize, j: usize) -> f32 {
        let n = self.num_entities();
        if i >= n || j >= n {
            return 0.0;
        }
        self.weights[i * n + j]
    }

    /// Undirected pairs `(i, j)`, `i < j`, with weight at or above `min_weight`.
    pub fn positive_pairs(&self, min_weight: f32) -> Vec<(usize, usize, f32)> {
        let n = self.num_entities();
        let mut pairs = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                let w = self.weights[i * n + j];
                if w > 0.0 && w >= min_weight {
                    pairs.push((i, j, w));
                }
            }
        }
        pairs
    }

    /// Indices linked to `i` with weight at or above `min_weight`.
    pub fn partners(&self, i: usize, min_weight: f32) -> Vec<usize> {
        let n = self.num_entities();
        if i >= n {
            return Vec::new();
        }
        (0..n)
            .filter(|&j| {
                let w = self.weights[i * n + j];
                j != i && w > 0.0 && w >= min_weight
            })
            .collect()
    }

    /// Move the snapshot onto the compute device.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<SnapshotTensors> {
        let n = self.num_entities();
        let indices: Vec<u32> = (0..n as u32).collect();
        Ok(SnapshotTensors {
            entity_indices: Tensor::from_vec(indices, n, device)?,
            entity_types: Tensor::from_vec(self.type_indices.clone(), n, device)?,
            content: Tensor::from_vec(self.content.clone(), (n, self.content_dim), device)?,
            edge_weights: Tensor::from_vec(self.weights.clone(), (n, n), device)?,
            num_entities: n,
        })
    }
}

/// Device-side snapshot tensors.
#[derive(Debug, Clone)]
pub struct SnapshotTensors {
    /// `(N,)` u32
    pub entity_indices: Tensor,
    /// `(N,)` u32
    pub entity_types: Tensor,
    /// `(N, content_dim)` f32
    pub content: Tensor,
    /// `(N, N)` f32, symmetric
    pub edge_weights: Tensor,
    pub num_entities: usize,
}
