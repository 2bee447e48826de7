use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Relative weights of the three training objectives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    pub contrastive: f32,
    pub link: f32,
    pub temporal: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            contrastive: 1.0,
            link: 1.0,
            temporal: 0.5,
        }
    }
}

/// Training loop section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    /// Positive pairs per optimizer step
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// Global gradient L2 norm ceiling
    pub max_grad_norm: f64,
    /// Negatives per anchor for the contrastive objective
    pub num_negatives: usize,
    pub temperature: f32,
    /// Edges at or above this weight are positive pairs
    pub min_edge_weight: f32,
    /// Use the edge weight as the link label instead of 1.0
    pub soft_link_labels: bool,
    pub loss_weights: LossWeights,
    /// Optimizer steps in the first annealing cycle
    pub scheduler_t0: usize,
    /// Cycle length multiplier after each restart
    pub scheduler_t_mult: usize,
    pub scheduler_eta_min: f64,
    pub checkpoint_dir: PathBuf,
    /// Save `epoch_<n>.safetensors` every n epochs (0 disables)
    pub checkpoint_every: usize,
    /// Run a full sync every n epochs (0 disables)
    pub sync_every: usize,
    pub sync_dry_run: bool,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            weight_decay: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            max_grad_norm: 1.0,
            num_negatives: 16,
            temperature: 0.07,
            min_edge_weight: 0.3,
            soft_link_labels: true,
            loss_weights: LossWeights::default(),
            scheduler_t0: 50,
            scheduler_t_mult: 2,
            scheduler_eta_min: 1e-6,
            checkpoint_dir: PathBuf::from("checkpoints"),
            checkpoint_every: 5,
            sync_every: 0,
            sync_dry_run: true,
            seed: 42,
        }
    }
}
