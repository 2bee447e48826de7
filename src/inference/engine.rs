//! Query answering over a cached encoding of the latest snapshot.
//!
//! The engine encodes a snapshot once (`refresh_state`) and answers every
//! query from that cache until the next refresh. Missing data (no snapshot,
//! unknown ids, malformed queries) yields neutral results; numeric failures
//! are returned as errors.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use candle_core::{Tensor, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::InferenceConfig;
use super::simulation::{ObservationSource, TrajectoryStep};
use crate::model::layers::{l2_norm, l2_normalize};
use crate::model::WorldModel;
use crate::store::{GraphSnapshot, SnapshotClient};

/// Entities listed in each simulated step.
const TRAJECTORY_TOP_K: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityScore {
    pub id: String,
    pub score: f32,
}

pub(crate) struct CachedState {
    pub(crate) snapshot: GraphSnapshot,
    /// `(1, D)`
    pub(crate) latent: Tensor,
    /// Contextual entity vectors, `(N, D)`
    pub(crate) entity_vectors: Tensor,
}

pub struct InferenceEngine {
    pub(crate) model: Arc<WorldModel>,
    pub(crate) client: SnapshotClient,
    pub(crate) config: InferenceConfig,
    pub(crate) state: Option<CachedState>,
    rng: StdRng,
}

impl InferenceEngine {
    pub fn new(model: Arc<WorldModel>, client: SnapshotClient, config: InferenceConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            model,
            client,
            config,
            state: None,
            rng,
        }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<WorldModel> {
        &self.model
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    /// Cached latent state as a host vector.
    pub fn latent(&self) -> Result<Option<Vec<f32>>> {
        match &self.state {
            Some(state) => Ok(Some(state.latent.flatten_all()?.to_vec1::<f32>()?)),
            None => Ok(None),
        }
    }

    /// Ids of the cached snapshot in index order.
    pub fn entity_ids(&self) -> &[String] {
        self.state
            .as_ref()
            .map(|s| s.snapshot.index.ids())
            .unwrap_or_default()
    }

    /// Encode `snapshot` in evaluation mode and cache the result.
    pub fn load_state(&mut self, snapshot: GraphSnapshot) -> Result<()> {
        let tensors = snapshot.to_tensors(self.model.device())?;
        let encoded = self.model.encode(&tensors, false)?;
        self.state = Some(CachedState {
            snapshot,
            latent: encoded.latent,
            entity_vectors: encoded.contextual,
        });
        Ok(())
    }

    /// Reload from the store and re-encode. Returns whether a state is cached.
    ///
    /// An unavailable snapshot drops the previous cache: answers from a
    /// stale index mapping would name the wrong entities.
    pub async fn refresh_state(&mut self) -> Result<bool> {
        match self.client.load_snapshot(self.model.config()).await {
            Some(snapshot) => {
                let n = snapshot.num_entities();
                self.load_state(snapshot)?;
                info!("Refreshed world-model state over {} entities", n);
                Ok(true)
            }
            None => {
                warn!("State refresh failed: no snapshot available");
                self.state = None;
                Ok(false)
            }
        }
    }

    /// Refresh only when nothing is cached yet.
    async fn ensure_state(&mut self) -> Result<bool> {
        if self.state.is_some() {
            return Ok(true);
        }
        self.refresh_state().await
    }

    /// Softmax over the live entities' next-entity logits, top `k` first.
    fn rank_next(
        &self,
        state: &CachedState,
        latent: &Tensor,
        k: usize,
    ) -> Result<Vec<EntityScore>> {
        let n = state.snapshot.num_entities();
        if n == 0 || k == 0 {
            return Ok(Vec::new());
        }
        let heads = self.model.heads();
        let logits = heads.next_entity.forward(latent)?.narrow(1, 0, n)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?
            .squeeze(0)?
            .to_vec1::<f32>()?;
        Ok(rank_scores(&state.snapshot, probs.into_iter().enumerate(), k))
    }

    pub async fn predict_next_entities(&mut self, top_k: usize) -> Result<Vec<EntityScore>> {
        if !self.ensure_state().await? {
            return Ok(Vec::new());
        }
        let Some(state) = &self.state else {
            return Ok(Vec::new());
        };
        self.rank_next(state, &state.latent, top_k)
    }

    /// Link probability in `[0, 1]`; exactly `0.0` when either id is unknown.
    pub async fn predict_link_probability(&mut self, source: &str, target: &str) -> Result<f32> {
        if !self.ensure_state().await? {
            return Ok(0.0);
        }
        let Some(state) = &self.state else {
            return Ok(0.0);
        };
        let index = &state.snapshot.index;
        let (Some(i), Some(j)) = (index.get(source), index.get(target)) else {
            debug!("Link query for unknown entity ({} / {})", source, target);
            return Ok(0.0);
        };

        let a = state.entity_vectors.narrow(0, i, 1)?;
        let b = state.entity_vectors.narrow(0, j, 1)?;
        let link = &self.model.heads().link;
        let p = link.probability(&a, &b)?.to_vec1::<f32>()?[0];
        Ok(p.clamp(0.0, 1.0))
    }

    /// Other entities ranked by cosine similarity to `entity`.
    pub async fn find_related_entities(
        &mut self,
        entity: &str,
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<EntityScore>> {
        if !self.ensure_state().await? {
            return Ok(Vec::new());
        }
        let Some(state) = &self.state else {
            return Ok(Vec::new());
        };
        let Some(query) = state.snapshot.index.get(entity) else {
            if self.client.get_entity(entity).await.is_some() {
                info!(
                    "Entity {} is in the store but not in the cached snapshot",
                    entity
                );
            } else {
                debug!("Related-entity query for unknown entity {}", entity);
            }
            return Ok(Vec::new());
        };

        let normalized = l2_normalize(&state.entity_vectors)?;
        let sims = normalized
            .matmul(&normalized.narrow(0, query, 1)?.t()?)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let candidates = sims
            .into_iter()
            .enumerate()
            .filter(|&(i, s)| i != query && s >= min_similarity);
        Ok(rank_scores(&state.snapshot, candidates, top_k))
    }

    /// Relevance of a `hidden_dim` query vector to the current state.
    /// `0.0` for a query of the wrong width.
    pub async fn score_query_relevance(&mut self, query: &[f32]) -> Result<f32> {
        let dim = self.model.config().hidden_dim;
        if query.len() != dim {
            warn!(
                "Relevance query has width {}, expected {}",
                query.len(),
                dim
            );
            return Ok(0.0);
        }
        if query.iter().any(|v| !v.is_finite()) {
            warn!("Relevance query contains non-finite values");
            return Ok(0.0);
        }
        if !self.ensure_state().await? {
            return Ok(0.0);
        }
        let Some(state) = &self.state else {
            return Ok(0.0);
        };

        let query = Tensor::from_slice(query, (1, dim), self.model.device())?;
        let score = self
            .model
            .heads()
            .relevance
            .forward(&state.latent, &query, false)?
            .to_vec1::<f32>()?[0];
        Ok(score)
    }

    /// Free-text search through the store, re-ranked by the relevance scorer
    /// using each hit's entity vector as the query.
    pub async fn search_relevant_entities(
        &mut self,
        text: &str,
        top_k: usize,
    ) -> Result<Vec<EntityScore>> {
        if !self.ensure_state().await? {
            return Ok(Vec::new());
        }
        let hits = self.client.search(text, self.config.search_limit).await;
        let Some(state) = &self.state else {
            return Ok(Vec::new());
        };

        let mut seen = HashSet::new();
        let indices: Vec<u32> = hits
            .iter()
            .filter_map(|id| state.snapshot.index.get(id))
            .filter(|i| seen.insert(*i))
            .map(|i| i as u32)
            .collect();
        if indices.is_empty() {
            debug!("Search for {:?} matched no known entities", text);
            return Ok(Vec::new());
        }

        let index = Tensor::from_slice(&indices, indices.len(), self.model.device())?;
        let queries = state.entity_vectors.index_select(&index, 0)?;
        let scores = self
            .model
            .heads()
            .relevance
            .forward(&state.latent, &queries, false)?
            .to_vec1::<f32>()?;
        let ranked = indices
            .iter()
            .map(|&i| i as usize)
            .zip(scores);
        Ok(rank_scores(&state.snapshot, ranked, top_k))
    }

    /// Roll the dynamics forward `num_steps` times from the cached state.
    pub async fn simulate_trajectory(
        &mut self,
        num_steps: usize,
        source: ObservationSource,
    ) -> Result<Vec<TrajectoryStep>> {
        if !self.ensure_state().await? {
            return Ok(Vec::new());
        }
        let Some(state) = self.state.take() else {
            return Ok(Vec::new());
        };
        let result = self.rollout(&state, num_steps, source);
        self.state = Some(state);
        result
    }

    fn rollout(
        &mut self,
        state: &CachedState,
        num_steps: usize,
        source: ObservationSource,
    ) -> Result<Vec<TrajectoryStep>> {
        let dim = self.model.config().hidden_dim;
        let device = self.model.device().clone();
        let mut z = state.latent.clone();
        let mut steps = Vec::with_capacity(num_steps);

        for step in 0..num_steps {
            let obs = match source {
                ObservationSource::SelfState => z.clone(),
                ObservationSource::Random => {
                    let noise: Vec<f32> = (0..dim)
                        .map(|_| self.rng.sample::<f32, _>(StandardNormal) * self.config.noise_std)
                        .collect();
                    Tensor::from_vec(noise, (1, dim), &device)?
                }
            };
            let next = self.model.step(&z, &obs, false)?;
            let state_change = l2_norm(&(&next - &z)?)?;
            if !state_change.is_finite() {
                anyhow::bail!(
                    "dynamics produced a non-finite latent at simulation step {}",
                    step
                );
            }
            steps.push(TrajectoryStep {
                step,
                latent: next.flatten_all()?.to_vec1::<f32>()?,
                state_change,
                top_entities: self.rank_next(state, &next, TRAJECTORY_TOP_K)?,
            });
            z = next;
        }
        Ok(steps)
    }
}

/// Highest-scoring `(index, score)` pairs as ids, ties broken by index.
fn rank_scores<I>(snapshot: &GraphSnapshot, scored: I, k: usize) -> Vec<EntityScore>
where
    I: IntoIterator<Item = (usize, f32)>,
{
    let mut scored: Vec<(usize, f32)> = scored.into_iter().filter(|(_, s)| s.is_finite()).collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored
        .into_iter()
        .take(k)
        .filter_map(|(i, score)| {
            snapshot.index.id(i).map(|id| EntityScore {
                id: id.to_string(),
                score,
            })
        })
        .collect()
}
