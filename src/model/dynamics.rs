//! Latent dynamics: advance `z` one step given an observation.
//!
//! Three interchangeable mechanisms share the `Dynamics` trait and are
//! selected by `ModelConfig::dynamics`. All of them take and return
//! `(1, hidden_dim)` tensors and layer-normalize their output.

use candle_core::{Result, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use super::config::{DynamicsKind, ModelConfig};
use super::layers::{sigmoid, AttentionBlock, FeedForward, Norm};

pub trait Dynamics {
    /// `z (1, D)`, `obs (1, D)` → `z' (1, D)`.
    fn predict(&self, z: &Tensor, obs: &Tensor, train: bool) -> Result<Tensor>;
}

// ============================================================================
// Recurrent
// ============================================================================

/// Single GRU cell with `z` as the hidden state.
#[derive(Debug, Clone)]
pub struct GruDynamics {
    input: Linear,
    hidden: Linear,
    norm: Norm,
}

impl GruDynamics {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input: candle_nn::linear(dim, 3 * dim, vb.pp("input"))?,
            hidden: candle_nn::linear(dim, 3 * dim, vb.pp("hidden"))?,
            norm: Norm::new(dim, vb.pp("norm"))?,
        })
    }
}

impl Dynamics for GruDynamics {
    fn predict(&self, z: &Tensor, obs: &Tensor, _train: bool) -> Result<Tensor> {
        let gx = self.input.forward(obs)?.chunk(3, D::Minus1)?;
        let gh = self.hidden.forward(z)?.chunk(3, D::Minus1)?;

        let reset = sigmoid(&(&gx[0] + &gh[0])?)?;
        let update = sigmoid(&(&gx[1] + &gh[1])?)?;
        let candidate = (&gx[2] + (&reset * &gh[2])?)?.tanh()?;

        // h' = (1 - u) * n + u * h
        let keep = (&update * z)?;
        let fresh = (update.affine(-1.0, 1.0)? * candidate)?;
        self.norm.forward(&(keep + fresh)?)
    }
}

// ============================================================================
// Attention
// ============================================================================

/// Self-attention over the two-element sequence `[z, proj(obs)]`.
#[derive(Debug, Clone)]
pub struct AttentionDynamics {
    obs_proj: Linear,
    blocks: Vec<AttentionBlock>,
    norm: Norm,
}

impl AttentionDynamics {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.hidden_dim;
        let blocks = (0..config.dynamics_layers.max(1))
            .map(|i| {
                AttentionBlock::new(
                    dim,
                    config.num_heads,
                    config.ff_dim(),
                    config.dropout,
                    vb.pp(format!("blocks.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            obs_proj: candle_nn::linear(dim, dim, vb.pp("obs_proj"))?,
            blocks,
            norm: Norm::new(dim, vb.pp("norm"))?,
        })
    }
}

impl Dynamics for AttentionDynamics {
    fn predict(&self, z: &Tensor, obs: &Tensor, train: bool) -> Result<Tensor> {
        let obs = self.obs_proj.forward(obs)?;
        let mut seq = Tensor::cat(&[z, &obs], 0)?;
        for block in &self.blocks {
            seq = block.forward(&seq, train)?;
        }
        self.norm.forward(&seq.narrow(0, 0, 1)?)
    }
}

// ============================================================================
// Direct
// ============================================================================

/// Feed-forward over the concatenation `[z ‖ obs]`, added residually to `z`.
#[derive(Debug, Clone)]
pub struct DirectDynamics {
    ff: FeedForward,
    norm: Norm,
}

impl DirectDynamics {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.hidden_dim;
        Ok(Self {
            ff: FeedForward::new(2 * dim, config.ff_dim(), dim, config.dropout, vb.pp("ff"))?,
            norm: Norm::new(dim, vb.pp("norm"))?,
        })
    }
}

impl Dynamics for DirectDynamics {
    fn predict(&self, z: &Tensor, obs: &Tensor, train: bool) -> Result<Tensor> {
        let delta = self.ff.forward(&Tensor::cat(&[z, obs], D::Minus1)?, train)?;
        self.norm.forward(&(z + delta)?)
    }
}

// ============================================================================
// Selection
// ============================================================================

#[derive(Debug, Clone)]
pub enum DynamicsModel {
    Recurrent(GruDynamics),
    Attention(AttentionDynamics),
    Direct(DirectDynamics),
}

impl DynamicsModel {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(match config.dynamics {
            DynamicsKind::Recurrent => Self::Recurrent(GruDynamics::new(config.hidden_dim, vb)?),
            DynamicsKind::Attention => Self::Attention(AttentionDynamics::new(config, vb)?),
            DynamicsKind::Direct => Self::Direct(DirectDynamics::new(config, vb)?),
        })
    }

    pub fn kind(&self) -> DynamicsKind {
        match self {
            Self::Recurrent(_) => DynamicsKind::Recurrent,
            Self::Attention(_) => DynamicsKind::Attention,
            Self::Direct(_) => DynamicsKind::Direct,
        }
    }
}

impl Dynamics for DynamicsModel {
    fn predict(&self, z: &Tensor, obs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Recurrent(d) => d.predict(z, obs, train),
            Self::Attention(d) => d.predict(z, obs, train),
            Self::Direct(d) => d.predict(z, obs, train),
        }
    }
}
