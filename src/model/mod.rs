//! The graph world model: entity encoder, graph state encoder, dynamics and
//! prediction heads, sharing one `VarMap` of trainable parameters.

pub mod config;
pub mod dynamics;
pub mod entity_encoder;
pub mod graph_encoder;
pub mod heads;
pub mod layers;

pub use config::{DynamicsKind, ModelConfig};
pub use dynamics::{Dynamics, DynamicsModel};
pub use heads::PredictionHeads;

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::store::SnapshotTensors;
use entity_encoder::EntityEncoder;
use graph_encoder::GraphEncoder;

/// Output of one full encode pass.
#[derive(Debug, Clone)]
pub struct EncodedGraph {
    /// Entity encoder output, `(N, D)`.
    pub entity_embeddings: Tensor,
    /// Graph encoder output per entity, `(N, D)`.
    pub contextual: Tensor,
    /// Pooled latent state, `(1, D)`.
    pub latent: Tensor,
}

pub struct WorldModel {
    config: ModelConfig,
    device: Device,
    varmap: VarMap,
    entity_encoder: EntityEncoder,
    graph_encoder: GraphEncoder,
    dynamics: DynamicsModel,
    heads: PredictionHeads,
}

impl WorldModel {
    /// Build a freshly initialized model on `device`.
    pub fn new(config: ModelConfig, device: &Device) -> anyhow::Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let entity_encoder = EntityEncoder::new(&config, vb.pp("entity_encoder"))?;
        let graph_encoder = GraphEncoder::new(&config, vb.pp("graph_encoder"))?;
        let dynamics = DynamicsModel::new(&config, vb.pp("dynamics"))?;
        let heads = PredictionHeads::new(&config, vb.pp("heads"))?;

        Ok(Self {
            config,
            device: device.clone(),
            varmap,
            entity_encoder,
            graph_encoder,
            dynamics,
            heads,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dynamics(&self) -> &DynamicsModel {
        &self.dynamics
    }

    pub fn heads(&self) -> &PredictionHeads {
        &self.heads
    }

    /// Encode entities only, without graph context.
    pub fn encode_entities(&self, tensors: &SnapshotTensors, train: bool) -> Result<Tensor> {
        self.entity_encoder.forward(
            &tensors.entity_indices,
            &tensors.entity_types,
            &tensors.content,
            train,
        )
    }

    /// Full encode: entity vectors, contextual vectors and the latent state.
    pub fn encode(&self, tensors: &SnapshotTensors, train: bool) -> Result<EncodedGraph> {
        let entity_embeddings = self.encode_entities(tensors, train)?;
        let (contextual, latent) =
            self.graph_encoder
                .forward(&entity_embeddings, &tensors.edge_weights, train)?;
        Ok(EncodedGraph {
            entity_embeddings,
            contextual,
            latent,
        })
    }

    /// Advance the latent state one step.
    pub fn step(&self, z: &Tensor, obs: &Tensor, train: bool) -> Result<Tensor> {
        self.dynamics.predict(z, obs, train)
    }

    /// Every trainable parameter, sorted by name.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    pub fn num_parameters(&self) -> usize {
        self.named_vars()
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }
}

impl std::fmt::Debug for WorldModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldModel")
            .field("dynamics", &self.dynamics.kind())
            .field("hidden_dim", &self.config.hidden_dim)
            .field("device", &self.device)
            .finish()
    }
}
