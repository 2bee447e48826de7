//! GraphStoreClient trait definition
//!
//! The narrow read/write contract the world model needs from the external
//! graph store. Node persistence, traversal and indexing stay on the store
//! side; this trait only lists what the snapshot client consumes.

use super::models::{AttentionEdgeRecord, EdgeUpsert, EntityRecord};
use anyhow::Result;
use async_trait::async_trait;

/// Abstract interface to the graph store.
///
/// Implementations must be `Send + Sync` to be shared via
/// `Arc<dyn GraphStoreClient>`.
///
/// # Implementations
///
/// - [`HttpGraphStore`](super::HttpGraphStore): JSON API client over reqwest
/// - [`MockGraphStore`](super::MockGraphStore): in-memory store for tests
#[async_trait]
pub trait GraphStoreClient: Send + Sync {
    /// List one page of entities, optionally filtered by type.
    async fn list_entities(
        &self,
        entity_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EntityRecord>>;

    /// Get a single entity by id.
    async fn get_entity(&self, id: &str) -> Result<Option<EntityRecord>>;

    /// Get attention edges with `weight >= min_weight`, at most `limit` of them.
    async fn get_attention_edges(
        &self,
        min_weight: f32,
        limit: usize,
    ) -> Result<Vec<AttentionEdgeRecord>>;

    /// Create or update a single attention edge.
    async fn upsert_attention_edge(&self, edge: &EdgeUpsert) -> Result<()>;

    /// Free-text search returning matching entity ids, best first.
    async fn search_entities(&self, query: &str, limit: usize) -> Result<Vec<String>>;
}
