use candle_core::{Result, Tensor, D};
use candle_nn::{Embedding, Linear, Module, VarBuilder};

use super::layers::{FeedForward, Norm};
use super::ModelConfig;

/// Maps each entity (index, type, content vector) to a `hidden_dim` vector.
#[derive(Debug, Clone)]
pub struct EntityEncoder {
    entities: Embedding,
    types: Embedding,
    content: Linear,
    combine: Linear,
    ff: FeedForward,
    norm: Norm,
}

impl EntityEncoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let combined = 2 * config.entity_dim + config.type_dim;
        Ok(Self {
            entities: candle_nn::embedding(
                config.max_entities,
                config.entity_dim,
                vb.pp("entities"),
            )?,
            types: candle_nn::embedding(config.num_entity_types, config.type_dim, vb.pp("types"))?,
            content: candle_nn::linear(config.content_dim, config.entity_dim, vb.pp("content"))?,
            combine: candle_nn::linear(combined, config.hidden_dim, vb.pp("combine"))?,
            ff: FeedForward::new(
                config.hidden_dim,
                config.ff_dim(),
                config.hidden_dim,
                config.dropout,
                vb.pp("ff"),
            )?,
            norm: Norm::new(config.hidden_dim, vb.pp("norm"))?,
        })
    }

    /// `(N,)` indices, `(N,)` types, `(N, content_dim)` content → `(N, hidden_dim)`.
    pub fn forward(
        &self,
        entity_indices: &Tensor,
        entity_types: &Tensor,
        content: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let entity = self.entities.forward(entity_indices)?;
        let kind = self.types.forward(entity_types)?;
        let content = self.content.forward(content)?;

        let h = self
            .combine
            .forward(&Tensor::cat(&[&entity, &kind, &content], D::Minus1)?)?;
        let h = (&h + self.ff.forward(&h, train)?)?;
        self.norm.forward(&h)
    }
}
