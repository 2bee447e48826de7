//! Optimization loop over successive graph snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::checkpoint::{self, Checkpoint, CheckpointMeta, FORMAT_VERSION};
use super::loss;
use super::optimizer::AdamW;
use super::sampling::{BatchBuilder, TrainingBatch};
use super::scheduler::CosineWarmRestarts;
use crate::error::TrainingError;
use crate::inference::{InferenceEngine, SyncStats};
use crate::model::WorldModel;
use crate::store::{GraphSnapshot, SnapshotClient, SnapshotTensors};
use crate::WorldModelConfig;

/// Loss components and optimizer state after one step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepMetrics {
    pub step: usize,
    pub total: f32,
    pub contrastive: Option<f32>,
    pub link: Option<f32>,
    pub temporal: Option<f32>,
    /// Gradient norm before clipping
    pub grad_norm: f64,
    pub lr: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub steps: usize,
    pub train_loss: Option<f32>,
    pub val_loss: Option<f32>,
    pub improved: bool,
    pub lr: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FitReport {
    pub epochs_completed: usize,
    pub epochs_skipped: usize,
    pub best_loss: Option<f32>,
    pub final_checkpoint: Option<PathBuf>,
    pub syncs: Vec<SyncStats>,
}

#[derive(Default)]
struct LossParts {
    total: Option<Tensor>,
    contrastive: Option<f32>,
    link: Option<f32>,
    temporal: Option<f32>,
}

impl LossParts {
    /// Add `weight * term` to the running total and record its raw value.
    fn add(&mut self, term: &Tensor, weight: f32) -> candle_core::Result<f32> {
        let value = term.to_scalar::<f32>()?;
        let weighted = term.affine(weight as f64, 0.0)?;
        self.total = Some(match self.total.take() {
            Some(total) => (total + weighted)?,
            None => weighted,
        });
        Ok(value)
    }
}

/// Owns the optimizer and schedule for one shared model.
pub struct Trainer {
    model: Arc<WorldModel>,
    client: SnapshotClient,
    config: WorldModelConfig,
    optimizer: AdamW,
    scheduler: CosineWarmRestarts,
    rng: StdRng,
    epoch: usize,
    global_step: usize,
    best_loss: Option<f32>,
    previous: Option<GraphSnapshot>,
}

impl Trainer {
    /// Build a fresh model on `device` and a trainer around it.
    pub fn new(config: WorldModelConfig, client: SnapshotClient, device: &Device) -> Result<Self> {
        let model = Arc::new(WorldModel::new(config.model.clone(), device)?);
        Self::with_model(config, model, client)
    }

    pub fn with_model(
        config: WorldModelConfig,
        model: Arc<WorldModel>,
        client: SnapshotClient,
    ) -> Result<Self> {
        let training = &config.training;
        if training.temperature.is_nan() || training.temperature <= 0.0 {
            return Err(TrainingError::InvalidConfig(format!(
                "temperature must be > 0, got {}",
                training.temperature
            ))
            .into());
        }

        let optimizer = AdamW::new(model.named_vars(), training)?;
        let scheduler = CosineWarmRestarts::new(
            training.learning_rate,
            training.scheduler_t0,
            training.scheduler_t_mult,
            training.scheduler_eta_min,
        );
        let rng = StdRng::seed_from_u64(training.seed);

        info!(
            "Trainer ready: {} parameters, {} dynamics, lr {}",
            model.num_parameters(),
            model.config().dynamics,
            training.learning_rate
        );

        Ok(Self {
            model,
            client,
            config,
            optimizer,
            scheduler,
            rng,
            epoch: 0,
            global_step: 0,
            best_loss: None,
            previous: None,
        })
    }

    pub fn model(&self) -> Arc<WorldModel> {
        self.model.clone()
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn best_loss(&self) -> Option<f32> {
        self.best_loss
    }

    pub fn learning_rate(&self) -> f64 {
        self.scheduler.lr()
    }

    fn batch_builder<'a>(&self, snapshot: &'a GraphSnapshot) -> BatchBuilder<'a> {
        let training = &self.config.training;
        BatchBuilder::new(
            snapshot,
            training.num_negatives,
            training.min_edge_weight,
            training.batch_size,
            training.soft_link_labels,
        )
    }

    /// Weighted loss for one batch over `current`, plus the temporal term
    /// when the snapshot before it is known.
    fn compute_loss(
        &self,
        current: &SnapshotTensors,
        previous: Option<&SnapshotTensors>,
        batch: &TrainingBatch,
        train: bool,
    ) -> candle_core::Result<LossParts> {
        let training = &self.config.training;
        let weights = training.loss_weights;
        let mut parts = LossParts::default();

        let encoded = self.model.encode(current, train)?;

        if weights.contrastive > 0.0 {
            let term = loss::contrastive_loss(
                &encoded.contextual,
                &batch.contrastive,
                training.temperature,
            )?;
            if let Some(term) = term {
                parts.contrastive = Some(parts.add(&term, weights.contrastive)?);
            }
        }

        if weights.link > 0.0 {
            let link = &self.model.heads().link;
            if let Some(term) =
                loss::link_loss(&encoded.contextual, &batch.links, |a, b| link.logits(a, b))?
            {
                parts.link = Some(parts.add(&term, weights.link)?);
            }
        }

        if let Some(previous) = previous.filter(|_| weights.temporal > 0.0) {
            let z_prev = self.model.encode(previous, train)?.latent;
            // Target branch: evaluation mode, no gradient
            let target = self.model.encode(current, false)?;
            let obs = target.entity_embeddings.mean_keepdim(0)?.detach();
            let predicted = self.model.step(&z_prev, &obs, train)?;
            let term = loss::temporal_loss(&predicted, &target.latent.detach())?;
            parts.temporal = Some(parts.add(&term, weights.temporal)?);
        }

        Ok(parts)
    }

    /// Forward, non-finite check, backward, clip, AdamW, schedule.
    ///
    /// Returns `None` when the batch yields no loss term at all.
    pub fn train_step(
        &mut self,
        current: &SnapshotTensors,
        previous: Option<&SnapshotTensors>,
        batch: &TrainingBatch,
    ) -> Result<Option<StepMetrics>> {
        let parts = self.compute_loss(current, previous, batch, true)?;
        let Some(total) = parts.total else {
            return Ok(None);
        };

        let step = self.global_step;
        for (component, value) in [
            ("contrastive", parts.contrastive),
            ("link", parts.link),
            ("temporal", parts.temporal),
        ] {
            if let Some(value) = value {
                loss::ensure_finite(component, value, step)?;
            }
        }
        let total_value = total.to_scalar::<f32>()?;
        loss::ensure_finite("total", total_value, step)?;

        let grads = total.backward()?;
        let lr = self.scheduler.lr();
        let grad_norm = self.optimizer.step(&grads, lr)?;
        self.scheduler.step();
        self.global_step += 1;

        let metrics = StepMetrics {
            step: self.global_step,
            total: total_value,
            contrastive: parts.contrastive,
            link: parts.link,
            temporal: parts.temporal,
            grad_norm,
            lr,
        };
        debug!(
            "step {}: loss {:.4} (contrastive {:?}, link {:?}, temporal {:?}) grad_norm {:.3}",
            metrics.step,
            metrics.total,
            metrics.contrastive,
            metrics.link,
            metrics.temporal,
            grad_norm
        );
        Ok(Some(metrics))
    }

    /// Loss over every positive pair in evaluation mode, without backward.
    fn evaluate(
        &self,
        snapshot: &GraphSnapshot,
        current: &SnapshotTensors,
        previous: Option<&SnapshotTensors>,
    ) -> Result<Option<f32>> {
        // Fixed per-epoch seed so the validation negatives do not drift
        let mut rng = StdRng::seed_from_u64(
            self.config
                .training
                .seed
                .wrapping_add(self.epoch as u64 + 1),
        );
        let builder = self.batch_builder(snapshot);
        let batch = builder.build(&builder.positive_pairs(), &mut rng);
        let parts = self.compute_loss(current, previous, &batch, false)?;
        Ok(match parts.total {
            Some(total) => Some(total.to_scalar::<f32>()?),
            None => None,
        })
    }

    /// One pass over the shuffled positive pairs of `snapshot`.
    ///
    /// `previous` is the snapshot seen one epoch earlier; with it, each step
    /// also trains the dynamics to predict `snapshot` from it.
    pub fn train_epoch(
        &mut self,
        snapshot: &GraphSnapshot,
        previous: Option<&GraphSnapshot>,
    ) -> Result<EpochReport> {
        let device = self.model.device().clone();
        let current = snapshot.to_tensors(&device)?;
        let previous_tensors = previous.map(|p| p.to_tensors(&device)).transpose()?;

        let mut batches = self.batch_builder(snapshot).batches(&mut self.rng);
        if batches.is_empty() {
            if previous_tensors.is_some() {
                // Temporal objective only
                batches.push(TrainingBatch::default());
            } else {
                warn!(
                    "No positive pairs at min_edge_weight {} and no previous snapshot; nothing to train",
                    self.config.training.min_edge_weight
                );
            }
        }

        let mut losses = Vec::with_capacity(batches.len());
        for batch in &batches {
            if let Some(metrics) = self.train_step(&current, previous_tensors.as_ref(), batch)? {
                losses.push(metrics.total);
            }
        }

        let val_loss = self
            .evaluate(snapshot, &current, previous_tensors.as_ref())?
            .filter(|v| v.is_finite());
        self.epoch += 1;

        let improved = match (val_loss, self.best_loss) {
            (Some(val), Some(best)) => val < best,
            (Some(_), None) => true,
            _ => false,
        };
        if improved {
            self.best_loss = val_loss;
        }

        let train_loss = if losses.is_empty() {
            None
        } else {
            Some(losses.iter().sum::<f32>() / losses.len() as f32)
        };

        let report = EpochReport {
            epoch: self.epoch,
            steps: losses.len(),
            train_loss,
            val_loss,
            improved,
            lr: self.scheduler.lr(),
        };
        info!(
            "Epoch {}: {} steps, train loss {:?}, val loss {:?}, lr {:.2e}",
            report.epoch, report.steps, report.train_loss, report.val_loss, report.lr
        );
        Ok(report)
    }

    /// Train for `epochs` epochs, one fresh snapshot each.
    ///
    /// Unavailable snapshots skip the epoch. `final.safetensors` is always
    /// written at the end.
    pub async fn fit(&mut self, epochs: usize) -> Result<FitReport> {
        let mut report = FitReport::default();
        let dir = self.config.training.checkpoint_dir.clone();

        for _ in 0..epochs {
            let Some(snapshot) = self.client.load_snapshot(self.model.config()).await else {
                warn!(
                    "Skipping epoch {}: graph snapshot unavailable",
                    self.epoch + 1
                );
                report.epochs_skipped += 1;
                continue;
            };

            let previous = self.previous.take();
            let epoch = self.train_epoch(&snapshot, previous.as_ref())?;
            report.epochs_completed += 1;

            if epoch.improved {
                self.save_checkpoint(&dir.join("best.safetensors"))?;
            }
            let every = self.config.training.checkpoint_every;
            if every > 0 && self.epoch % every == 0 {
                self.save_checkpoint(&dir.join(format!("epoch_{:04}.safetensors", self.epoch)))?;
            }
            let sync_every = self.config.training.sync_every;
            if sync_every > 0 && self.epoch % sync_every == 0 {
                report
                    .syncs
                    .push(self.sync(self.config.training.sync_dry_run).await?);
            }

            self.previous = Some(snapshot);
        }

        let final_path = dir.join("final.safetensors");
        self.save_checkpoint(&final_path)?;
        report.final_checkpoint = Some(final_path);
        report.best_loss = self.best_loss;
        info!(
            "Training finished: {} epochs completed, {} skipped, best loss {:?}",
            report.epochs_completed, report.epochs_skipped, report.best_loss
        );
        Ok(report)
    }

    /// Run a full sync with the current parameters.
    pub async fn sync(&self, dry_run: bool) -> Result<SyncStats> {
        let mut engine = InferenceEngine::new(
            self.model.clone(),
            self.client.clone(),
            self.config.inference.clone(),
        );
        engine.full_sync(dry_run).await
    }

    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        let meta = CheckpointMeta {
            format_version: FORMAT_VERSION,
            epoch: self.epoch,
            global_step: self.global_step,
            optimizer_step: self.optimizer.step_count(),
            scheduler: self.scheduler.clone(),
            config: self.config.clone(),
            best_loss: self.best_loss,
            saved_at: Utc::now(),
        };
        checkpoint::save(path, &self.model, &self.optimizer, &meta)?;
        Ok(())
    }

    /// Restore parameters, optimizer moments, schedule and counters.
    pub fn resume(&mut self, path: &Path) -> Result<()> {
        let checkpoint = Checkpoint::read(path, self.model.device())?;
        checkpoint.restore_model(&self.model)?;
        checkpoint.restore_optimizer(&mut self.optimizer)?;

        let meta = checkpoint.meta;
        self.scheduler = meta.scheduler;
        self.epoch = meta.epoch;
        self.global_step = meta.global_step;
        self.best_loss = meta.best_loss;
        self.rng = StdRng::seed_from_u64(self.config.training.seed.wrapping_add(meta.epoch as u64));
        self.previous = None;

        info!(
            "Resumed from {} at epoch {}, step {}",
            path.display(),
            self.epoch,
            self.global_step
        );
        Ok(())
    }
}
