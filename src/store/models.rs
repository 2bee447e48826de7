//! Wire models exchanged with the external graph store.

use serde::{Deserialize, Serialize};

/// An entity as listed by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Free-text content, if the store keeps any
    #[serde(default)]
    pub content: Option<String>,
    /// Content vector; absent or wrong-width vectors are replaced by zeros
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl EntityRecord {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            content: None,
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// A learned attention edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionEdgeRecord {
    pub source: String,
    pub target: String,
    /// Co-relevance weight in [0, 1]
    pub weight: f32,
    /// How many queries reinforced this edge
    #[serde(default)]
    pub query_count: u64,
    #[serde(default)]
    pub confidence: Option<f32>,
}

impl AttentionEdgeRecord {
    pub fn new(source: impl Into<String>, target: impl Into<String>, weight: f32) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            weight,
            query_count: 0,
            confidence: None,
        }
    }
}

/// Request body for creating or updating one attention edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeUpsert {
    pub source: String,
    pub target: String,
    pub weight: f32,
    /// Provenance of the write (one id per sync run)
    pub query_id: String,
}

/// One free-text search match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    #[serde(default)]
    pub score: Option<f32>,
}
