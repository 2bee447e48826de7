//! Inference and simulation over a trained world model.
//!
//! `InferenceEngine` caches one encoded snapshot and answers prediction
//! queries from it; `sync` adds edge proposals and the write-back path.

pub mod config;
pub mod engine;
pub mod simulation;
pub mod sync;

pub use config::InferenceConfig;
pub use engine::{EntityScore, InferenceEngine};
pub use simulation::{ObservationSource, TrajectoryStep};
pub use sync::{EdgeProposal, ProposalRun, SyncStats};
