use serde::{Deserialize, Serialize};

use super::simulation::ObservationSource;

/// Inference and sync section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Minimum link probability for an edge proposal
    pub proposal_threshold: f32,
    /// Cap on proposals written per sync
    pub max_proposals: usize,
    pub top_k: usize,
    /// Cosine floor for related-entity queries
    pub min_similarity: f32,
    pub simulation_steps: usize,
    pub observation_source: ObservationSource,
    /// Standard deviation of random observations
    pub noise_std: f32,
    /// Store search hits considered by text relevance queries
    pub search_limit: usize,
    /// Seed for random observations
    pub seed: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            proposal_threshold: 0.8,
            max_proposals: 100,
            top_k: 10,
            min_similarity: 0.0,
            simulation_steps: 10,
            observation_source: ObservationSource::SelfState,
            noise_std: 1.0,
            search_limit: 50,
            seed: 7,
        }
    }
}
