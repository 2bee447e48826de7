//! In-memory mock implementation of GraphStoreClient for testing without a real store.

use super::models::{AttentionEdgeRecord, EdgeUpsert, EntityRecord};
use super::traits::GraphStoreClient;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// In-memory mock implementation of GraphStoreClient for testing.
///
/// Stores entities and edges in `Vec`s behind async `RwLock`s and records
/// every write, so tests can assert on how many calls reached the store.
/// `set_unreachable(true)` makes every call fail like a dead network.
#[derive(Default)]
pub struct MockGraphStore {
    entities: RwLock<Vec<EntityRecord>>,
    edges: RwLock<Vec<AttentionEdgeRecord>>,
    writes: RwLock<Vec<EdgeUpsert>>,
    unreachable: AtomicBool,
}

impl MockGraphStore {
    /// Create a new empty mock store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with entities and edges.
    pub fn with_graph(entities: Vec<EntityRecord>, edges: Vec<AttentionEdgeRecord>) -> Self {
        Self {
            entities: RwLock::new(entities),
            edges: RwLock::new(edges),
            ..Self::default()
        }
    }

    pub async fn add_entity(&self, entity: EntityRecord) {
        self.entities.write().await.push(entity);
    }

    pub async fn add_edge(&self, edge: AttentionEdgeRecord) {
        self.edges.write().await.push(edge);
    }

    /// Simulate an unreachable store.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of edge writes received so far.
    pub async fn write_count(&self) -> usize {
        self.writes.read().await.len()
    }

    /// All edge writes received so far, in order.
    pub async fn writes(&self) -> Vec<EdgeUpsert> {
        self.writes.read().await.clone()
    }

    pub async fn edges(&self) -> Vec<AttentionEdgeRecord> {
        self.edges.read().await.clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("mock graph store unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStoreClient for MockGraphStore {
    async fn list_entities(
        &self,
        entity_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EntityRecord>> {
        self.check_reachable()?;
        let entities = self.entities.read().await;
        Ok(entities
            .iter()
            .filter(|e| entity_type.map_or(true, |t| e.entity_type == t))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_entity(&self, id: &str) -> Result<Option<EntityRecord>> {
        self.check_reachable()?;
        let entities = self.entities.read().await;
        Ok(entities.iter().find(|e| e.id == id).cloned())
    }

    async fn get_attention_edges(
        &self,
        min_weight: f32,
        limit: usize,
    ) -> Result<Vec<AttentionEdgeRecord>> {
        self.check_reachable()?;
        let edges = self.edges.read().await;
        Ok(edges
            .iter()
            .filter(|e| e.weight >= min_weight)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_attention_edge(&self, edge: &EdgeUpsert) -> Result<()> {
        self.check_reachable()?;
        self.writes.write().await.push(edge.clone());

        let mut edges = self.edges.write().await;
        if let Some(existing) = edges
            .iter_mut()
            .find(|e| e.source == edge.source && e.target == edge.target)
        {
            existing.weight = edge.weight;
            existing.query_count += 1;
        } else {
            let mut record = AttentionEdgeRecord::new(&edge.source, &edge.target, edge.weight);
            record.query_count = 1;
            edges.push(record);
        }
        Ok(())
    }

    async fn search_entities(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        self.check_reachable()?;
        let query_lower = query.to_lowercase();
        let entities = self.entities.read().await;
        Ok(entities
            .iter()
            .filter(|e| {
                e.id.to_lowercase().contains(&query_lower)
                    || e
                        .content
                        .as_deref()
                        .is_some_and(|c| c.to_lowercase().contains(&query_lower))
            })
            .take(limit)
            .map(|e| e.id.clone())
            .collect())
    }
}
