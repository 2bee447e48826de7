//! Single-file checkpoints in safetensors format.
//!
//! Tensors are stored as `model.<param>`, `optim.m.<param>` and
//! `optim.v.<param>`. Training state and the full configuration travel as
//! JSON under the `checkpoint` metadata key. Loading compares architecture
//! fields first and refuses any mismatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::optimizer::AdamW;
use super::scheduler::CosineWarmRestarts;
use crate::error::CheckpointError;
use crate::model::{ModelConfig, WorldModel};
use crate::WorldModelConfig;

pub const FORMAT_VERSION: u32 = 1;
const METADATA_KEY: &str = "checkpoint";
const MODEL_PREFIX: &str = "model.";
const M_PREFIX: &str = "optim.m.";
const V_PREFIX: &str = "optim.v.";

/// Training state stored alongside the tensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub format_version: u32,
    pub epoch: usize,
    pub global_step: usize,
    pub optimizer_step: usize,
    pub scheduler: CosineWarmRestarts,
    pub config: WorldModelConfig,
    pub best_loss: Option<f32>,
    pub saved_at: DateTime<Utc>,
}

/// Write a checkpoint atomically: a temp file next to `path`, then rename.
pub fn save(
    path: &Path,
    model: &WorldModel,
    optimizer: &AdamW,
    meta: &CheckpointMeta,
) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut tensors: Vec<(String, Tensor)> = model
        .named_vars()
        .into_iter()
        .map(|(name, var)| (format!("{}{}", MODEL_PREFIX, name), var.as_tensor().clone()))
        .collect();
    for (name, m, v) in optimizer.moments() {
        tensors.push((format!("{}{}", M_PREFIX, name), m.clone()));
        tensors.push((format!("{}{}", V_PREFIX, name), v.clone()));
    }

    let json = serde_json::to_string(meta).map_err(|e| CheckpointError::Format {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let metadata = Some(HashMap::from([(METADATA_KEY.to_string(), json)]));

    let tmp = tmp_path(path);
    safetensors::serialize_to_file(tensors, &metadata, &tmp).map_err(|e| {
        CheckpointError::Format {
            path: tmp.clone(),
            message: e.to_string(),
        }
    })?;
    std::fs::rename(&tmp, path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!(
        "Saved checkpoint {} (epoch {}, step {})",
        path.display(),
        meta.epoch,
        meta.global_step
    );
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// A checkpoint read into memory on a device.
#[derive(Debug)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub meta: CheckpointMeta,
    tensors: HashMap<String, Tensor>,
}

impl Checkpoint {
    pub fn read(path: &Path, device: &Device) -> Result<Self, CheckpointError> {
        let buffer = std::fs::read(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CheckpointError::NotFound(path.to_path_buf())
            } else {
                CheckpointError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let format_error = |message: String| CheckpointError::Format {
            path: path.to_path_buf(),
            message,
        };

        let (_, header) =
            SafeTensors::read_metadata(&buffer).map_err(|e| format_error(e.to_string()))?;
        let json = header
            .metadata()
            .as_ref()
            .and_then(|m| m.get(METADATA_KEY))
            .ok_or_else(|| format_error(format!("missing `{}` metadata", METADATA_KEY)))?;
        let meta: CheckpointMeta =
            serde_json::from_str(json).map_err(|e| format_error(e.to_string()))?;
        if meta.format_version != FORMAT_VERSION {
            return Err(format_error(format!(
                "unsupported format version {} (expected {})",
                meta.format_version, FORMAT_VERSION
            )));
        }

        let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;
        debug!("Read {} tensors from {}", tensors.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            meta,
            tensors,
        })
    }

    /// Refuse checkpoints produced by a differently shaped model.
    pub fn verify_architecture(&self, current: &ModelConfig) -> Result<(), CheckpointError> {
        let saved = &self.meta.config.model;
        for ((field, checkpoint), (_, now)) in saved
            .architecture()
            .into_iter()
            .zip(current.architecture())
        {
            if checkpoint != now {
                return Err(CheckpointError::ArchitectureMismatch {
                    field,
                    checkpoint,
                    current: now,
                });
            }
        }
        if saved.dynamics != current.dynamics {
            return Err(CheckpointError::DynamicsMismatch {
                checkpoint: saved.dynamics.to_string(),
                current: current.dynamics.to_string(),
            });
        }
        Ok(())
    }

    fn tensor(&self, name: String, expected: &[usize]) -> Result<&Tensor, CheckpointError> {
        let tensor = self
            .tensors
            .get(&name)
            .ok_or_else(|| CheckpointError::MissingTensor(name.clone()))?;
        if tensor.dims() != expected {
            return Err(CheckpointError::ShapeMismatch {
                name,
                checkpoint: tensor.dims().to_vec(),
                current: expected.to_vec(),
            });
        }
        Ok(tensor)
    }

    /// Copy parameters into `model`. Nothing is written unless every
    /// tensor is present with the right shape.
    pub fn restore_model(&self, model: &WorldModel) -> Result<(), CheckpointError> {
        self.verify_architecture(model.config())?;

        let vars = model.named_vars();
        let mut staged = Vec::with_capacity(vars.len());
        for (name, var) in &vars {
            let tensor = self.tensor(format!("{}{}", MODEL_PREFIX, name), var.as_tensor().dims())?;
            staged.push((var, tensor));
        }
        for (var, tensor) in staged {
            var.set(tensor)?;
        }
        info!(
            "Restored {} parameters from {}",
            vars.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Restore AdamW moments and its step counter.
    pub fn restore_optimizer(&self, optimizer: &mut AdamW) -> Result<(), CheckpointError> {
        let mut staged = Vec::new();
        for (name, m, v) in optimizer.moments() {
            let saved_m = self.tensor(format!("{}{}", M_PREFIX, name), m.dims())?;
            let saved_v = self.tensor(format!("{}{}", V_PREFIX, name), v.dims())?;
            staged.push((name.to_string(), saved_m.clone(), saved_v.clone()));
        }
        for (name, m, v) in staged {
            optimizer.set_moments(&name, m, v)?;
        }
        optimizer.set_step_count(self.meta.optimizer_step);
        Ok(())
    }
}

/// Load parameters from `path` into an already built model.
pub fn load_into(path: &Path, model: &WorldModel) -> Result<CheckpointMeta, CheckpointError> {
    let checkpoint = Checkpoint::read(path, model.device())?;
    checkpoint.restore_model(model)?;
    Ok(checkpoint.meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::tiny_config;
    use crate::training::TrainingConfig;

    fn meta(model: &ModelConfig) -> CheckpointMeta {
        CheckpointMeta {
            format_version: FORMAT_VERSION,
            epoch: 3,
            global_step: 42,
            optimizer_step: 42,
            scheduler: CosineWarmRestarts::new(1e-3, 10, 2, 0.0),
            config: WorldModelConfig {
                model: model.clone(),
                ..WorldModelConfig::default()
            },
            best_loss: Some(0.5),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_round_trip_restores_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ckpt.safetensors");

        let source = WorldModel::new(tiny_config(), &Device::Cpu).unwrap();
        let optimizer = AdamW::new(source.named_vars(), &TrainingConfig::default()).unwrap();
        save(&path, &source, &optimizer, &meta(source.config())).unwrap();
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());

        let target = WorldModel::new(tiny_config(), &Device::Cpu).unwrap();
        let restored = load_into(&path, &target).unwrap();
        assert_eq!(restored.epoch, 3);
        assert_eq!(restored.best_loss, Some(0.5));

        for ((name, a), (_, b)) in source.named_vars().iter().zip(target.named_vars().iter()) {
            let flat = |t: &Tensor| t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let (a, b) = (flat(a.as_tensor()), flat(b.as_tensor()));
            assert_eq!(a, b, "parameter {} differs", name);
        }
    }

    #[test]
    fn test_store_token_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let model = WorldModel::new(tiny_config(), &Device::Cpu).unwrap();
        let optimizer = AdamW::new(model.named_vars(), &TrainingConfig::default()).unwrap();

        let mut meta = meta(model.config());
        meta.config.store.api_key = Some("graph-store-bearer-7f3a".into());
        save(&path, &model, &optimizer, &meta).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let token = b"graph-store-bearer-7f3a";
        assert!(!bytes.windows(token.len()).any(|w| w == token));

        let restored = load_into(&path, &model).unwrap();
        assert!(restored.config.store.api_key.is_none());
        assert_eq!(restored.config.store.url, meta.config.store.url);
    }

    #[test]
    fn test_hidden_dim_mismatch_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let source = WorldModel::new(tiny_config(), &Device::Cpu).unwrap();
        let optimizer = AdamW::new(source.named_vars(), &TrainingConfig::default()).unwrap();
        save(&path, &source, &optimizer, &meta(source.config())).unwrap();

        let wider = ModelConfig {
            hidden_dim: 16,
            ..tiny_config()
        };
        let target = WorldModel::new(wider, &Device::Cpu).unwrap();
        let err = load_into(&path, &target).unwrap_err();
        match err {
            CheckpointError::ArchitectureMismatch {
                field,
                checkpoint,
                current,
            } => {
                assert_eq!(field, "hidden_dim");
                assert_eq!(checkpoint, 8);
                assert_eq!(current, 16);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_dynamics_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let source = WorldModel::new(tiny_config(), &Device::Cpu).unwrap();
        let optimizer = AdamW::new(source.named_vars(), &TrainingConfig::default()).unwrap();
        save(&path, &source, &optimizer, &meta(source.config())).unwrap();

        let other = ModelConfig {
            dynamics: crate::model::DynamicsKind::Direct,
            ..tiny_config()
        };
        let target = WorldModel::new(other, &Device::Cpu).unwrap();
        assert!(matches!(
            load_into(&path, &target),
            Err(CheckpointError::DynamicsMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_file_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let model = WorldModel::new(tiny_config(), &Device::Cpu).unwrap();

        let missing = dir.path().join("absent.safetensors");
        assert!(matches!(
            load_into(&missing, &model),
            Err(CheckpointError::NotFound(_))
        ));

        let garbage = dir.path().join("garbage.safetensors");
        std::fs::write(&garbage, b"not a checkpoint").unwrap();
        assert!(matches!(
            load_into(&garbage, &model),
            Err(CheckpointError::Format { .. })
        ));
    }

    #[test]
    fn test_optimizer_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let model = WorldModel::new(tiny_config(), &Device::Cpu).unwrap();
        let optimizer = AdamW::new(model.named_vars(), &TrainingConfig::default()).unwrap();
        save(&path, &model, &optimizer, &meta(model.config())).unwrap();

        let mut fresh = AdamW::new(model.named_vars(), &TrainingConfig::default()).unwrap();
        let checkpoint = Checkpoint::read(&path, &Device::Cpu).unwrap();
        checkpoint.restore_optimizer(&mut fresh).unwrap();
        assert_eq!(fresh.step_count(), 42);
        assert_eq!(checkpoint.meta.scheduler.t_0, 10);
    }
}
