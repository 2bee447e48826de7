//! Training engine: batch sampling, losses, AdamW, LR schedule, checkpoints.

pub mod checkpoint;
pub mod config;
pub mod loss;
pub mod optimizer;
pub mod sampling;
pub mod scheduler;
mod trainer;

pub use checkpoint::{Checkpoint, CheckpointMeta};
pub use config::{LossWeights, TrainingConfig};
pub use optimizer::AdamW;
pub use sampling::{BatchBuilder, ContrastiveSample, LinkSample, NegativeSampler, TrainingBatch};
pub use scheduler::CosineWarmRestarts;
pub use trainer::{EpochReport, FitReport, StepMetrics, Trainer};
