//! Integrity errors.
//!
//! Data-availability problems (store unreachable, empty graph) never reach
//! these types: they degrade to empty results at the snapshot client. The
//! errors here are the ones that must stop the caller.

use std::path::PathBuf;

use thiserror::Error;

/// Checkpoint persistence and restoration failures.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(PathBuf),

    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed checkpoint {path}: {message}")]
    Format { path: PathBuf, message: String },

    #[error(
        "architecture mismatch on `{field}`: checkpoint has {checkpoint}, model has {current}"
    )]
    ArchitectureMismatch {
        field: &'static str,
        checkpoint: usize,
        current: usize,
    },

    #[error("dynamics mismatch: checkpoint uses `{checkpoint}`, model uses `{current}`")]
    DynamicsMismatch { checkpoint: String, current: String },

    #[error("checkpoint is missing tensor `{0}`")]
    MissingTensor(String),

    #[error("shape mismatch for `{name}`: checkpoint {checkpoint:?}, model {current:?}")]
    ShapeMismatch {
        name: String,
        checkpoint: Vec<usize>,
        current: Vec<usize>,
    },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Failures raised by the training loop.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("non-finite {component} loss ({value}) at step {step}; lower the learning rate or tighten gradient clipping")]
    NonFiniteLoss {
        component: &'static str,
        value: f32,
        step: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
