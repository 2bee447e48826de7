//! Prediction heads read out of the latent state and entity vectors.

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, Linear, Module, VarBuilder};

use super::layers::{sigmoid, FeedForward};
use super::ModelConfig;

/// `z → logits` over the full entity capacity.
#[derive(Debug, Clone)]
pub struct NextEntityHead {
    proj: Linear,
}

impl NextEntityHead {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: candle_nn::linear(config.hidden_dim, config.max_entities, vb.pp("proj"))?,
        })
    }

    /// `(1, D)` → `(1, max_entities)`.
    pub fn forward(&self, z: &Tensor) -> Result<Tensor> {
        self.proj.forward(z)
    }
}

/// Bilinear link scorer over a shared projection of both endpoints.
#[derive(Debug, Clone)]
pub struct LinkPredictor {
    proj: Linear,
    bilinear: Tensor,
    bias: Tensor,
}

impl LinkPredictor {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let stdev = 1.0 / (config.link_dim as f64).sqrt();
        Ok(Self {
            proj: candle_nn::linear(config.hidden_dim, config.link_dim, vb.pp("proj"))?,
            bilinear: vb.get_with_hints(
                (config.link_dim, config.link_dim),
                "bilinear",
                Init::Randn { mean: 0.0, stdev },
            )?,
            bias: vb.get_with_hints(1, "bias", Init::Const(0.0))?,
        })
    }

    /// Row-aligned `(B, D)` pairs → `(B,)` logits.
    pub fn logits(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let pa = self.proj.forward(a)?;
        let pb = self.proj.forward(b)?;
        pa.matmul(&self.bilinear)?
            .mul(&pb)?
            .sum(D::Minus1)?
            .broadcast_add(&self.bias)
    }

    /// Row-aligned `(B, D)` pairs → `(B,)` probabilities in `[0, 1]`.
    pub fn probability(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        sigmoid(&self.logits(a, b)?)?.clamp(0f32, 1f32)
    }

    /// All pairs of `(N, D)` vectors → `(N, N)` logits.
    pub fn pairwise_logits(&self, xs: &Tensor) -> Result<Tensor> {
        let p = self.proj.forward(xs)?;
        p.matmul(&self.bilinear)?
            .matmul(&p.t()?)?
            .broadcast_add(&self.bias)
    }

    /// All pairs of `(N, D)` vectors → `(N, N)` probabilities in `[0, 1]`.
    pub fn pairwise_probability(&self, xs: &Tensor) -> Result<Tensor> {
        sigmoid(&self.pairwise_logits(xs)?)?.clamp(0f32, 1f32)
    }
}

/// `[z ‖ query] → [0, 1]` relevance score.
#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    ff: FeedForward,
}

impl RelevanceScorer {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.hidden_dim;
        Ok(Self {
            ff: FeedForward::new(2 * dim, dim, 1, config.dropout, vb.pp("ff"))?,
        })
    }

    /// `z (1, D)` broadcast against `queries (B, D)` → `(B,)` scores.
    pub fn forward(&self, z: &Tensor, queries: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, dim) = queries.dims2()?;
        let z = z.broadcast_as((batch, dim))?;
        let logits = self
            .ff
            .forward(&Tensor::cat(&[&z, queries], D::Minus1)?, train)?
            .squeeze(D::Minus1)?;
        sigmoid(&logits)?.clamp(0f32, 1f32)
    }
}

#[derive(Debug, Clone)]
pub struct PredictionHeads {
    pub next_entity: NextEntityHead,
    pub link: LinkPredictor,
    pub relevance: RelevanceScorer,
}

impl PredictionHeads {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            next_entity: NextEntityHead::new(config, vb.pp("next_entity"))?,
            link: LinkPredictor::new(config, vb.pp("link"))?,
            relevance: RelevanceScorer::new(config, vb.pp("relevance"))?,
        })
    }
}
