//! Edge proposals and write-back to the graph store.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::engine::InferenceEngine;
use crate::model::layers::l2_norm;
use crate::store::EdgeUpsert;

/// A suggested new attention edge between two currently unlinked entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeProposal {
    pub source: String,
    pub target: String,
    pub probability: f32,
}

/// Outcome of one proposal pass.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalRun {
    /// Provenance id attached to every write of this run
    pub query_id: String,
    pub proposals: Vec<EdgeProposal>,
    pub num_written: usize,
    pub num_failed: usize,
    pub dry_run: bool,
}

/// Summary of a full sync; every field is set even when nothing was proposed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub num_entities: usize,
    pub num_edges: usize,
    pub latent_norm: f32,
    pub num_proposals: usize,
    pub num_written: usize,
    pub dry_run: bool,
    pub query_id: String,
}

fn new_query_id() -> String {
    format!("world-model-{}", Uuid::new_v4())
}

impl InferenceEngine {
    /// Score every unlinked pair `i < j` and keep those at or above
    /// `threshold`, most probable first, capped at `max_proposals`.
    ///
    /// A dry run does exactly the same computation and writes nothing.
    pub async fn propose_new_edges(
        &mut self,
        threshold: f32,
        dry_run: bool,
    ) -> anyhow::Result<ProposalRun> {
        let query_id = new_query_id();
        self.propose_with_id(threshold, dry_run, query_id).await
    }

    async fn propose_with_id(
        &mut self,
        threshold: f32,
        dry_run: bool,
        query_id: String,
    ) -> anyhow::Result<ProposalRun> {
        let proposals = self.score_proposals(threshold).await?;

        let mut run = ProposalRun {
            query_id,
            proposals,
            num_written: 0,
            num_failed: 0,
            dry_run,
        };
        if !dry_run {
            for proposal in &run.proposals {
                let edge = EdgeUpsert {
                    source: proposal.source.clone(),
                    target: proposal.target.clone(),
                    weight: proposal.probability,
                    query_id: run.query_id.clone(),
                };
                if self.client.write_edge(&edge).await {
                    run.num_written += 1;
                } else {
                    run.num_failed += 1;
                }
            }
            if run.num_failed > 0 {
                warn!(
                    "{} of {} edge writes failed (query {})",
                    run.num_failed,
                    run.proposals.len(),
                    run.query_id
                );
            }
        }

        info!(
            "Proposed {} edges at threshold {} ({}, {} written)",
            run.proposals.len(),
            threshold,
            if dry_run { "dry run" } else { "live" },
            run.num_written
        );
        Ok(run)
    }

    async fn score_proposals(&mut self, threshold: f32) -> anyhow::Result<Vec<EdgeProposal>> {
        if self.state.is_none() && !self.refresh_state().await? {
            return Ok(Vec::new());
        }
        let Some(state) = &self.state else {
            return Ok(Vec::new());
        };
        let snapshot = &state.snapshot;
        let n = snapshot.num_entities();
        if n < 2 || threshold > 1.0 {
            return Ok(Vec::new());
        }

        let probs = self
            .model
            .heads()
            .link
            .pairwise_probability(&state.entity_vectors)?
            .to_vec2::<f32>()?;

        let mut scored = Vec::new();
        for (i, row) in probs.iter().enumerate() {
            for (j, &p) in row.iter().enumerate().skip(i + 1) {
                if snapshot.weight(i, j) > 0.0 || !p.is_finite() || p < threshold {
                    continue;
                }
                scored.push((i, j, p.clamp(0.0, 1.0)));
            }
        }
        scored.sort_by(|a, b| b.2.total_cmp(&a.2).then((a.0, a.1).cmp(&(b.0, b.1))));
        scored.truncate(self.config.max_proposals);

        Ok(scored
            .into_iter()
            .filter_map(|(i, j, probability)| {
                Some(EdgeProposal {
                    source: snapshot.index.id(i)?.to_string(),
                    target: snapshot.index.id(j)?.to_string(),
                    probability,
                })
            })
            .collect())
    }

    /// Refresh, re-encode, propose at `proposal_threshold` and write back.
    pub async fn full_sync(&mut self, dry_run: bool) -> anyhow::Result<SyncStats> {
        let query_id = new_query_id();
        let mut stats = SyncStats {
            dry_run,
            query_id: query_id.clone(),
            ..SyncStats::default()
        };

        if !self.refresh_state().await? {
            warn!("Full sync skipped: graph snapshot unavailable");
            return Ok(stats);
        }
        if let Some(state) = &self.state {
            stats.num_entities = state.snapshot.num_entities();
            stats.num_edges = state.snapshot.num_edges;
            stats.latent_norm = l2_norm(&state.latent)?;
        }

        let threshold = self.config.proposal_threshold;
        let run = self.propose_with_id(threshold, dry_run, query_id).await?;
        stats.num_proposals = run.proposals.len();
        stats.num_written = run.num_written;

        info!(
            "Sync {}: {} entities, {} edges, |z| = {:.3}, {} proposals, {} written",
            stats.query_id,
            stats.num_entities,
            stats.num_edges,
            stats.latent_norm,
            stats.num_proposals,
            stats.num_written
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use candle_core::Device;

    use super::*;
    use crate::inference::InferenceConfig;
    use crate::model::test_support::tiny_config;
    use crate::model::WorldModel;
    use crate::store::{AttentionEdgeRecord, EntityRecord, MockGraphStore, SnapshotClient};
    use crate::StoreConfig;

    fn store() -> Arc<MockGraphStore> {
        let entities = (0..6)
            .map(|i| EntityRecord::new(format!("n{}", i), "note"))
            .collect();
        let edges = vec![AttentionEdgeRecord::new("n0", "n1", 0.9)];
        Arc::new(MockGraphStore::with_graph(entities, edges))
    }

    fn engine_for(store: Arc<MockGraphStore>) -> InferenceEngine {
        let model = Arc::new(WorldModel::new(tiny_config(), &Device::Cpu).unwrap());
        let client = SnapshotClient::new(store, StoreConfig::default());
        InferenceEngine::new(
            model,
            client,
            InferenceConfig {
                max_proposals: 4,
                ..InferenceConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_threshold_above_one_proposes_nothing() {
        let store = store();
        let mut engine = engine_for(store.clone());
        let run = engine.propose_new_edges(1.1, false).await.unwrap();
        assert!(run.proposals.is_empty());
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_proposals_skip_linked_pairs_and_are_capped() {
        let mut engine = engine_for(store());
        let run = engine.propose_new_edges(0.0, true).await.unwrap();
        // 15 pairs, one already linked, capped at 4
        assert_eq!(run.proposals.len(), 4);
        assert!(run
            .proposals
            .iter()
            .all(|p| !(p.source == "n0" && p.target == "n1")));
        assert!(run
            .proposals
            .windows(2)
            .all(|w| w[0].probability >= w[1].probability));
    }

    #[tokio::test]
    async fn test_dry_run_matches_live_run_without_writes() {
        let store = store();
        let mut engine = engine_for(store.clone());

        let dry = engine.propose_new_edges(0.0, true).await.unwrap();
        assert_eq!(store.write_count().await, 0);

        let live = engine.propose_new_edges(0.0, false).await.unwrap();
        assert_eq!(dry.proposals, live.proposals);
        assert_eq!(live.num_written, live.proposals.len());
        assert_eq!(store.write_count().await, live.proposals.len());

        let writes = store.writes().await;
        assert!(writes.iter().all(|w| w.query_id == live.query_id));
        assert_ne!(dry.query_id, live.query_id);
    }

    #[tokio::test]
    async fn test_write_failures_are_counted() {
        let store = store();
        let mut engine = engine_for(store.clone());
        engine.refresh_state().await.unwrap();
        store.set_unreachable(true);

        let run = engine.propose_new_edges(0.0, false).await.unwrap();
        assert_eq!(run.num_written, 0);
        assert_eq!(run.num_failed, run.proposals.len());
    }

    #[tokio::test]
    async fn test_full_sync_stats_always_populated() {
        let mut engine = engine_for(store());
        let stats = engine.full_sync(true).await.unwrap();
        assert_eq!(stats.num_entities, 6);
        assert_eq!(stats.num_edges, 1);
        assert!(stats.latent_norm > 0.0);
        assert!(stats.dry_run);
        assert_eq!(stats.num_written, 0);

        let json = serde_json::to_value(&stats).unwrap();
        for key in ["num_entities", "num_edges", "latent_norm"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }

        let unreachable = store();
        unreachable.set_unreachable(true);
        let stats = engine_for(unreachable).full_sync(false).await.unwrap();
        assert_eq!(stats.num_entities, 0);
        assert_eq!(stats.latent_norm, 0.0);
        assert!(!stats.query_id.is_empty());
    }
}
