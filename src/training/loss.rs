//! Training objectives: InfoNCE contrastive, link BCE, temporal consistency.

use candle_core::{DType, Device, Result, Tensor, D};

use super::sampling::{ContrastiveSample, LinkSample};
use crate::error::TrainingError;
use crate::model::layers::l2_normalize;

/// InfoNCE over `anchor (B, D)`, `positive (B, D)`, `negatives (B, K, D)`.
///
/// All vectors are L2-normalized; similarities are divided by `temperature`
/// and the positive is class 0.
pub fn info_nce(
    anchor: &Tensor,
    positive: &Tensor,
    negatives: &Tensor,
    temperature: f32,
) -> Result<Tensor> {
    let anchor = l2_normalize(anchor)?;
    let candidates = Tensor::cat(&[&positive.unsqueeze(1)?, negatives], 1)?;
    let candidates = l2_normalize(&candidates)?;

    // (B, 1+K, D) x (B, D, 1) → (B, 1+K)
    let logits = candidates
        .matmul(&anchor.unsqueeze(2)?)?
        .squeeze(2)?
        .affine(1.0 / temperature.max(1e-6) as f64, 0.0)?;
    let labels = Tensor::zeros(logits.dim(0)?, DType::U32, logits.device())?;
    candle_nn::loss::cross_entropy(&logits, &labels)
}

/// Contrastive loss for sampled triples over the `(N, D)` entity vectors.
/// `None` when there are no samples.
pub fn contrastive_loss(
    embeddings: &Tensor,
    samples: &[ContrastiveSample],
    temperature: f32,
) -> Result<Option<Tensor>> {
    let Some(first) = samples.first() else {
        return Ok(None);
    };
    let k = first.negatives.len();
    let device = embeddings.device();
    let dim = embeddings.dim(D::Minus1)?;

    let anchors: Vec<u32> = samples.iter().map(|s| s.anchor as u32).collect();
    let positives: Vec<u32> = samples.iter().map(|s| s.positive as u32).collect();
    let negatives: Vec<u32> = samples
        .iter()
        .flat_map(|s| s.negatives.iter().map(|&n| n as u32))
        .collect();
    if negatives.len() != samples.len() * k {
        candle_core::bail!("contrastive samples must share one negative count");
    }

    let anchor = embeddings.index_select(&index_tensor(&anchors, device)?, 0)?;
    let positive = embeddings.index_select(&index_tensor(&positives, device)?, 0)?;
    let negative = embeddings
        .index_select(&index_tensor(&negatives, device)?, 0)?
        .reshape((samples.len(), k, dim))?;
    info_nce(&anchor, &positive, &negative, temperature).map(Some)
}

/// Binary cross-entropy on logits, `max(x, 0) - x*y + ln(1 + e^-|x|)`,
/// averaged over the batch.
pub fn bce_with_logits(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    ((logits.relu()? - (logits * labels)?)? + softplus)?.mean_all()
}

/// Link loss for labeled pairs; `logits_fn` scores row-aligned pairs.
/// `None` when there are no samples.
pub fn link_loss<F>(
    embeddings: &Tensor,
    samples: &[LinkSample],
    logits_fn: F,
) -> Result<Option<Tensor>>
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    if samples.is_empty() {
        return Ok(None);
    }
    let device = embeddings.device();
    let sources: Vec<u32> = samples.iter().map(|s| s.source as u32).collect();
    let targets: Vec<u32> = samples.iter().map(|s| s.target as u32).collect();
    let labels: Vec<f32> = samples.iter().map(|s| s.label.clamp(0.0, 1.0)).collect();

    let a = embeddings.index_select(&index_tensor(&sources, device)?, 0)?;
    let b = embeddings.index_select(&index_tensor(&targets, device)?, 0)?;
    let logits = logits_fn(&a, &b)?;
    let labels = Tensor::from_vec(labels, samples.len(), device)?;
    bce_with_logits(&logits, &labels).map(Some)
}

/// `1 - cos(predicted, target)`, with no gradient flowing into `target`.
pub fn temporal_loss(predicted: &Tensor, target: &Tensor) -> Result<Tensor> {
    let target = l2_normalize(&target.detach())?;
    let predicted = l2_normalize(predicted)?;
    (predicted * target)?
        .sum(D::Minus1)?
        .mean_all()?
        .affine(-1.0, 1.0)
}

/// Fail on NaN or infinite loss components.
pub fn ensure_finite(
    component: &'static str,
    value: f32,
    step: usize,
) -> std::result::Result<(), TrainingError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(TrainingError::NonFiniteLoss {
            component,
            value,
            step,
        })
    }
}

fn index_tensor(indices: &[u32], device: &Device) -> Result<Tensor> {
    Tensor::from_slice(indices, indices.len(), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_info_nce_finite_and_non_negative() {
        let device = Device::Cpu;
        for seed_scale in [0.0f32, 0.1, 1.0, 50.0] {
            let anchor = Tensor::randn(0f32, 1f32, (4, 8), &device).unwrap();
            let noise = Tensor::randn(0f32, 1f32, (4, 8), &device).unwrap();
            let positive = (noise * seed_scale as f64).unwrap();
            let negatives = Tensor::randn(0f32, 1f32, (4, 5, 8), &device).unwrap();
            let loss = scalar(&info_nce(&anchor, &positive, &negatives, 0.07).unwrap());
            assert!(loss.is_finite(), "loss {}", loss);
            assert!(loss >= 0.0, "loss {}", loss);
        }
    }

    #[test]
    fn test_info_nce_prefers_aligned_positive() {
        let device = Device::Cpu;
        let anchor = Tensor::new(&[[1f32, 0.0]], &device).unwrap();
        let aligned = Tensor::new(&[[2f32, 0.0]], &device).unwrap();
        let opposed = Tensor::new(&[[-1f32, 0.0]], &device).unwrap();
        let negatives = Tensor::new(&[[[0f32, 1.0], [0.0, -1.0]]], &device).unwrap();

        let good = scalar(&info_nce(&anchor, &aligned, &negatives, 0.1).unwrap());
        let bad = scalar(&info_nce(&anchor, &opposed, &negatives, 0.1).unwrap());
        assert!(good < bad);
    }

    #[test]
    fn test_contrastive_loss_from_samples() {
        let device = Device::Cpu;
        let embeddings = Tensor::randn(0f32, 1f32, (6, 4), &device).unwrap();
        let samples = vec![
            ContrastiveSample { anchor: 0, positive: 1, negatives: vec![2, 3] },
            ContrastiveSample { anchor: 4, positive: 5, negatives: vec![0, 0] },
        ];
        let loss = contrastive_loss(&embeddings, &samples, 0.5).unwrap();
        let loss = loss.unwrap();
        assert!(scalar(&loss) >= 0.0);
        assert!(contrastive_loss(&embeddings, &[], 0.5).unwrap().is_none());
    }

    #[test]
    fn test_bce_with_logits_matches_reference() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[0f32, 2.0, -3.0, 100.0, -100.0], &device).unwrap();
        let labels = Tensor::new(&[0.5f32, 1.0, 0.0, 1.0, 0.0], &device).unwrap();
        let loss = scalar(&bce_with_logits(&logits, &labels).unwrap());

        let reference: f32 = [(0f32, 0.5f32), (2.0, 1.0), (-3.0, 0.0), (100.0, 1.0), (-100.0, 0.0)]
            .iter()
            .map(|&(x, y)| x.max(0.0) - x * y + (1.0 + (-x.abs()).exp()).ln())
            .sum::<f32>()
            / 5.0;
        assert!((loss - reference).abs() < 1e-5);
        assert!(loss.is_finite());
    }

    #[test]
    fn test_temporal_loss_range_and_stop_gradient() {
        let device = Device::Cpu;
        let z = candle_core::Var::new(&[[1f32, 0.0, 0.0]], &device).unwrap();
        let target = candle_core::Var::new(&[[0f32, 1.0, 0.0]], &device).unwrap();

        let loss = temporal_loss(z.as_tensor(), target.as_tensor()).unwrap();
        assert!((scalar(&loss) - 1.0).abs() < 1e-5);

        let grads = loss.backward().unwrap();
        assert!(grads.get(z.as_tensor()).is_some());
        assert!(grads.get(target.as_tensor()).is_none());

        let same = temporal_loss(z.as_tensor(), z.as_tensor()).unwrap();
        assert!(scalar(&same).abs() < 1e-5);
    }

    #[test]
    fn test_ensure_finite() {
        assert!(ensure_finite("link", 0.5, 1).is_ok());
        let err = ensure_finite("temporal", f32::NAN, 7).unwrap_err();
        assert!(err.to_string().contains("temporal"));
        assert!(ensure_finite("link", f32::INFINITY, 1).is_err());
    }
}
