//! Graph World Model
//!
//! A learned, compressed representation of a dynamic knowledge graph:
//! - Snapshot client over an external graph store (entities + attention edges)
//! - Entity and graph-state encoders producing a fixed-size latent state `z`
//! - A dynamics model that advances `z`, plus next-entity / link / relevance heads
//! - A multi-objective training engine with atomic checkpoints
//! - An inference engine that answers prediction queries and proposes edges

pub mod error;
pub mod inference;
pub mod model;
pub mod store;
pub mod training;

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use inference::{InferenceConfig, InferenceEngine};
pub use model::{ModelConfig, WorldModel};
pub use store::SnapshotClient;
pub use training::{Trainer, TrainingConfig};

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level configuration file structure.
///
/// Every section is optional; missing fields fall back to their defaults.
/// The full structure is also embedded in every checkpoint so a model can be
/// traced back to the configuration that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorldModelConfig {
    /// Compute device: `auto`, `cpu` or `cuda`
    pub device: DeviceChoice,
    pub store: StoreConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub inference: InferenceConfig,
}

/// Graph store connection section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the graph store HTTP API
    pub url: String,
    /// Optional bearer token. Never serialized, so it stays out of checkpoints.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Page size used when listing entities
    pub page_size: usize,
    /// Maximum number of attention edges fetched per snapshot
    pub max_edges: usize,
    /// Minimum weight requested from the store when fetching edges
    pub edge_min_weight: f32,
    pub list_timeout_secs: u64,
    pub edge_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub search_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".into(),
            api_key: None,
            page_size: 200,
            max_edges: 10_000,
            edge_min_weight: 0.0,
            list_timeout_secs: 30,
            edge_timeout_secs: 30,
            write_timeout_secs: 10,
            search_timeout_secs: 10,
        }
    }
}

/// Where heavy numeric work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    /// CUDA device 0 when compiled in and available, CPU otherwise
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl DeviceChoice {
    /// Resolve to a concrete candle device.
    pub fn resolve(self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Auto => Ok(Device::cuda_if_available(0)?),
            Self::Cuda => Ok(Device::new_cuda(0)?),
        }
    }
}

impl std::str::FromStr for DeviceChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => anyhow::bail!("Unknown device '{}': expected auto, cpu or cuda", other),
        }
    }
}

impl WorldModelConfig {
    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "world-model.yaml" in CWD. If the file
    /// doesn't exist, falls back to pure env var / defaults.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::load_yaml(yaml_path);

        if let Ok(url) = std::env::var("WORLD_MODEL_STORE_URL") {
            config.store.url = url;
        }
        if let Ok(key) = std::env::var("WORLD_MODEL_STORE_API_KEY") {
            config.store.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Ok(dir) = std::env::var("WORLD_MODEL_CHECKPOINT_DIR") {
            config.training.checkpoint_dir = dir.into();
        }
        if let Ok(device) = std::env::var("WORLD_MODEL_DEVICE") {
            config.device = device.parse()?;
        }

        config.model.validate()?;
        Ok(config)
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> Self {
        let default_path = Path::new("world-model.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                Self::default()
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod config_tests {
    use super::*;
    use crate::model::DynamicsKind;
    use std::io::Write;

    #[test]
    fn test_yaml_config_loading() {
        let yaml = r#"
device: cpu
store:
  url: http://graph:9000
  page_size: 50
model:
  hidden_dim: 64
  num_heads: 4
  dynamics: gru
training:
  epochs: 3
  num_negatives: 8
  loss_weights:
    temporal: 0.25
inference:
  proposal_threshold: 0.9
"#;

        let config: WorldModelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.device, DeviceChoice::Cpu);
        assert_eq!(config.store.url, "http://graph:9000");
        assert_eq!(config.store.page_size, 50);
        assert_eq!(config.model.hidden_dim, 64);
        assert_eq!(config.model.dynamics, DynamicsKind::Recurrent);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.num_negatives, 8);
        assert!((config.training.loss_weights.temporal - 0.25).abs() < f32::EPSILON);
        // Unspecified weights keep their defaults
        assert!((config.training.loss_weights.contrastive - 1.0).abs() < f32::EPSILON);
        assert!((config.inference.proposal_threshold - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_yaml_defaults() {
        let config = WorldModelConfig::default();
        assert_eq!(config.device, DeviceChoice::Auto);
        assert_eq!(config.store.url, "http://localhost:8000");
        assert!(config.store.api_key.is_none());
        assert_eq!(config.store.list_timeout_secs, 30);
        assert_eq!(config.store.write_timeout_secs, 10);
        assert!(config.model.validate().is_ok());
    }

    #[test]
    fn test_device_choice_parsing() {
        assert_eq!("CPU".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cpu);
        assert_eq!("gpu".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cuda);
        assert!("tpu".parse::<DeviceChoice>().is_err());
        assert!(DeviceChoice::Cpu.resolve().unwrap().is_cpu());
    }

    /// Combined test for YAML file loading and env var overrides.
    /// Runs as a single test to avoid parallel env var race conditions.
    #[test]
    fn test_yaml_and_env_lifecycle() {
        fn clear_env() {
            for var in &[
                "WORLD_MODEL_STORE_URL",
                "WORLD_MODEL_STORE_API_KEY",
                "WORLD_MODEL_CHECKPOINT_DIR",
                "WORLD_MODEL_DEVICE",
            ] {
                std::env::remove_var(var);
            }
        }

        // --- Phase 1: YAML values loaded correctly ---
        let yaml = r#"
store:
  url: http://yaml-host:8000
  api_key: yaml-key
training:
  checkpoint_dir: /tmp/yaml-checkpoints
"#;
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("world-model.yaml");
        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        clear_env();

        let config = WorldModelConfig::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.store.url, "http://yaml-host:8000");
        assert_eq!(config.store.api_key.as_deref(), Some("yaml-key"));
        assert_eq!(
            config.training.checkpoint_dir,
            std::path::PathBuf::from("/tmp/yaml-checkpoints")
        );

        // --- Phase 2: Env vars override YAML ---
        std::env::set_var("WORLD_MODEL_STORE_URL", "http://env-host:8000");
        std::env::set_var("WORLD_MODEL_DEVICE", "cpu");

        let config = WorldModelConfig::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.store.url, "http://env-host:8000");
        assert_eq!(config.device, DeviceChoice::Cpu);
        // YAML value still used where no env override
        assert_eq!(config.store.api_key.as_deref(), Some("yaml-key"));

        // --- Phase 3: Invalid device in env is rejected ---
        std::env::set_var("WORLD_MODEL_DEVICE", "quantum");
        assert!(WorldModelConfig::from_yaml_and_env(Some(&file_path)).is_err());

        clear_env();

        // --- Phase 4: No YAML file → defaults ---
        let nonexistent = Path::new("/tmp/nonexistent-world-model-12345.yaml");
        let config = WorldModelConfig::from_yaml_and_env(Some(nonexistent)).unwrap();
        assert_eq!(config.store.url, "http://localhost:8000");
        assert_eq!(config.device, DeviceChoice::Auto);
    }
}
