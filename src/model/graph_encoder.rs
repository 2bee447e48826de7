use candle_core::{Result, Tensor, D};
use candle_nn::{Init, Linear, Module, VarBuilder};

use super::layers::{AttentionBlock, Norm};
use super::ModelConfig;

/// Contextualizes entity vectors with self-attention and pools them into
/// the `(1, hidden_dim)` latent state.
#[derive(Debug, Clone)]
pub struct GraphEncoder {
    blocks: Vec<AttentionBlock>,
    final_norm: Norm,
    pool_query: Tensor,
    pool_proj: Linear,
    pool_norm: Norm,
    scale: f64,
}

impl GraphEncoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.hidden_dim;
        let blocks = (0..config.num_layers)
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
            blocks,
            final_norm: Norm::new(dim, vb.pp("final_norm"))?,
            pool_query: vb.get_with_hints(
                (1, dim),
                "pool_query",
                Init::Randn {
                    mean: 0.0,
                    stdev: 0.02,
                },
            )?,
            pool_proj: candle_nn::linear(dim, dim, vb.pp("pool_proj"))?,
            pool_norm: Norm::new(dim, vb.pp("pool_norm"))?,
            scale: 1.0 / (dim as f64).sqrt(),
        })
    }

    /// Returns `(contextual (N, D), latent (1, D))`.
    ///
    /// `_edge_weights` is accepted so callers pass the full snapshot, but it
    /// does not bias attention.
    pub fn forward(
        &self,
        entity_vectors: &Tensor,
        _edge_weights: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let mut h = entity_vectors.clone();
        for block in &self.blocks {
            h = block.forward(&h, train)?;
        }
        let contextual = self.final_norm.forward(&h)?;

        // (1, D) x (D, N) → (1, N)
        let scores = self
            .pool_query
            .matmul(&contextual.t()?)?
            .affine(self.scale, 0.0)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let pooled = weights.matmul(&contextual)?;
        let latent = self.pool_norm.forward(&self.pool_proj.forward(&pooled)?)?;

        Ok((contextual, latent))
    }
}
