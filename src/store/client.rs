//! Snapshot client: time-bounded, failure-tolerant access to the graph store.
//!
//! Every store call is wrapped in `tokio::time::timeout`. Timeouts and errors
//! are logged and turned into empty results so one flaky call cannot abort
//! a training epoch or a batch of edge proposals.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::models::{AttentionEdgeRecord, EdgeUpsert, EntityRecord};
use super::snapshot::GraphSnapshot;
use super::traits::GraphStoreClient;
use crate::model::ModelConfig;
use crate::StoreConfig;

/// Failure-tolerant wrapper around a `GraphStoreClient`.
///
/// Cheaply cloneable; clones share the underlying store.
#[derive(Clone)]
pub struct SnapshotClient {
    store: Arc<dyn GraphStoreClient>,
    config: StoreConfig,
}

impl SnapshotClient {
    pub fn new(store: Arc<dyn GraphStoreClient>, config: StoreConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Run one store call under a timeout, mapping failure to `None`.
    async fn bounded<T, F>(&self, operation: &str, secs: u64, call: F) -> Option<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(Duration::from_secs(secs), call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Graph store {} failed: {:#}", operation, e);
                None
            }
            Err(_) => {
                warn!("Graph store {} timed out after {}s", operation, secs);
                None
            }
        }
    }

    /// Fetch up to `max_entities` entities, page by page.
    ///
    /// Any failed page yields an empty list: a partial entity set would
    /// silently shift the index mapping.
    pub async fn fetch_entities(&self, max_entities: usize) -> Vec<EntityRecord> {
        let page_size = self.config.page_size.max(1);
        let mut entities = Vec::new();
        let mut offset = 0;

        loop {
            let page = self
                .bounded(
                    "list_entities",
                    self.config.list_timeout_secs,
                    self.store.list_entities(None, page_size, offset),
                )
                .await;
            let Some(page) = page else {
                return Vec::new();
            };

            let fetched = page.len();
            entities.extend(page);
            offset += fetched;
            // Fetch one entity past the cap so truncation can be reported
            if fetched < page_size || entities.len() > max_entities {
                break;
            }
        }

        debug!("Fetched {} entities from graph store", entities.len());
        entities
    }

    /// Fetch attention edges at or above the configured minimum weight.
    pub async fn fetch_edges(&self) -> Vec<AttentionEdgeRecord> {
        self.bounded(
            "get_attention_edges",
            self.config.edge_timeout_secs,
            self.store
                .get_attention_edges(self.config.edge_min_weight, self.config.max_edges),
        )
        .await
        .unwrap_or_default()
    }

    /// Fetch a fresh full snapshot. `None` when the store is unreachable or
    /// holds no entities.
    pub async fn load_snapshot(&self, model: &ModelConfig) -> Option<GraphSnapshot> {
        let entities = self.fetch_entities(model.max_entities).await;
        if entities.is_empty() {
            warn!("Graph store returned no entities; snapshot unavailable");
            return None;
        }
        let edges = self.fetch_edges().await;

        let snapshot = GraphSnapshot::build(
            &entities,
            &edges,
            model.max_entities,
            model.num_entity_types,
            model.content_dim,
        );
        info!(
            "Loaded snapshot: {} entities, {} edges",
            snapshot.num_entities(),
            snapshot.num_edges
        );
        Some(snapshot)
    }

    pub async fn get_entity(&self, id: &str) -> Option<EntityRecord> {
        self.bounded(
            "get_entity",
            self.config.list_timeout_secs,
            self.store.get_entity(id),
        )
        .await
        .flatten()
    }

    /// Write one edge. Returns whether the store accepted it.
    pub async fn write_edge(&self, edge: &EdgeUpsert) -> bool {
        self.bounded(
            "upsert_attention_edge",
            self.config.write_timeout_secs,
            self.store.upsert_attention_edge(edge),
        )
        .await
        .is_some()
    }

    pub async fn search(&self, query: &str, limit: usize) -> Vec<String> {
        self.bounded(
            "search_entities",
            self.config.search_timeout_secs,
            self.store.search_entities(query, limit),
        )
        .await
        .unwrap_or_default()
    }
}
