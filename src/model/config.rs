//! Architecture configuration for the world model.
//!
//! Every dimension here is baked into parameter shapes; checkpoints record
//! the full config and refuse to load into a model built differently.

use serde::{Deserialize, Serialize};

use crate::error::TrainingError;

/// Which dynamics mechanism advances the latent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DynamicsKind {
    /// GRU cell: `z` is the hidden state, the observation the single input step
    #[default]
    #[serde(alias = "gru")]
    Recurrent,
    /// Self-attention over the 2-element sequence `[z, obs]`
    #[serde(alias = "transformer")]
    Attention,
    /// Feed-forward over `[z ‖ obs]`
    #[serde(alias = "mlp")]
    Direct,
}

impl std::fmt::Display for DynamicsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recurrent => write!(f, "recurrent"),
            Self::Attention => write!(f, "attention"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

impl std::str::FromStr for DynamicsKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "recurrent" | "gru" => Ok(Self::Recurrent),
            "attention" | "transformer" => Ok(Self::Attention),
            "direct" | "mlp" => Ok(Self::Direct),
            other => anyhow::bail!(
                "Unknown dynamics '{}': expected recurrent, attention or direct",
                other
            ),
        }
    }
}

/// Model architecture parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Capacity of the entity table and of the next-entity classifier.
    pub max_entities: usize,
    /// Capacity of the type table (row 0 is the unknown type).
    pub num_entity_types: usize,
    /// Width of the per-entity learned table and the content projection.
    pub entity_dim: usize,
    pub type_dim: usize,
    /// Width of the content vectors supplied by the store.
    pub content_dim: usize,
    /// Width of every entity vector and of the latent state `z`.
    pub hidden_dim: usize,
    pub num_heads: usize,
    /// Self-attention blocks in the graph state encoder.
    pub num_layers: usize,
    /// Feed-forward inner width as a multiple of `hidden_dim`.
    pub ff_multiplier: usize,
    /// Projection width of the link predictor's bilinear form.
    pub link_dim: usize,
    pub dropout: f32,
    pub dynamics: DynamicsKind,
    /// Attention blocks used by the `attention` dynamics.
    pub dynamics_layers: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_entities: 1000,
            num_entity_types: 32,
            entity_dim: 64,
            type_dim: 16,
            content_dim: 384,
            hidden_dim: 128,
            num_heads: 4,
            num_layers: 2,
            ff_multiplier: 4,
            link_dim: 64,
            dropout: 0.1,
            dynamics: DynamicsKind::Recurrent,
            dynamics_layers: 1,
        }
    }
}

impl ModelConfig {
    /// Reject configurations that cannot produce a valid model.
    pub fn validate(&self) -> Result<(), TrainingError> {
        let sizes = [
            ("max_entities", self.max_entities),
            ("num_entity_types", self.num_entity_types),
            ("entity_dim", self.entity_dim),
            ("type_dim", self.type_dim),
            ("content_dim", self.content_dim),
            ("hidden_dim", self.hidden_dim),
            ("num_heads", self.num_heads),
            ("ff_multiplier", self.ff_multiplier),
            ("link_dim", self.link_dim),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(TrainingError::InvalidConfig(format!("{} must be > 0", name)));
        }
        if self.hidden_dim % self.num_heads != 0 {
            return Err(TrainingError::InvalidConfig(format!(
                "hidden_dim ({}) must be divisible by num_heads ({})",
                self.hidden_dim, self.num_heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TrainingError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    pub fn ff_dim(&self) -> usize {
        self.hidden_dim * self.ff_multiplier
    }

    /// Architecture fields as `(name, value)` pairs, compared on checkpoint load.
    pub fn architecture(&self) -> [(&'static str, usize); 11] {
        [
            ("max_entities", self.max_entities),
            ("num_entity_types", self.num_entity_types),
            ("entity_dim", self.entity_dim),
            ("type_dim", self.type_dim),
            ("content_dim", self.content_dim),
            ("hidden_dim", self.hidden_dim),
            ("num_heads", self.num_heads),
            ("num_layers", self.num_layers),
            ("ff_multiplier", self.ff_multiplier),
            ("link_dim", self.link_dim),
            ("dynamics_layers", self.dynamics_layers),
        ]
    }
}
