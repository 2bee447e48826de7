//! AdamW over candle `Var`s with global gradient-norm clipping.
//!
//! Moments are keyed by parameter name so they can be written to and read
//! back from checkpoints.

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};

use super::TrainingConfig;

struct TrackedParam {
    name: String,
    var: Var,
    m: Tensor,
    v: Tensor,
}

/// Decoupled-weight-decay Adam.
pub struct AdamW {
    params: Vec<TrackedParam>,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    max_grad_norm: f64,
    step: usize,
}

impl AdamW {
    pub fn new(vars: Vec<(String, Var)>, config: &TrainingConfig) -> Result<Self> {
        let params = vars
            .into_iter()
            .map(|(name, var)| {
                let m = var.as_tensor().zeros_like()?;
                let v = var.as_tensor().zeros_like()?;
                Ok(TrackedParam { name, var, m, v })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            params,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
            max_grad_norm: config.max_grad_norm,
            step: 0,
        })
    }

    /// Optimizer steps taken so far (bias-correction counter).
    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Global L2 norm of all gradients present in `grads`.
    pub fn grad_norm(&self, grads: &GradStore) -> Result<f64> {
        let mut total = 0f64;
        for param in &self.params {
            if let Some(grad) = grads.get(param.var.as_tensor()) {
                total += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            }
        }
        Ok(total.sqrt())
    }

    /// Clip, then apply one AdamW update at learning rate `lr`.
    ///
    /// Returns the gradient norm before clipping.
    pub fn step(&mut self, grads: &GradStore, lr: f64) -> Result<f64> {
        let norm = self.grad_norm(grads)?;
        let clip = if self.max_grad_norm > 0.0 && norm > self.max_grad_norm {
            self.max_grad_norm / (norm + 1e-6)
        } else {
            1.0
        };

        self.step += 1;
        let t = self.step as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);

        for param in &mut self.params {
            let Some(grad) = grads.get(param.var.as_tensor()) else {
                continue;
            };
            let grad = grad.affine(clip, 0.0)?;

            let grad_sq = grad.sqr()?;
            let m = (param.m.affine(self.beta1, 0.0)? + grad.affine(1.0 - self.beta1, 0.0)?)?;
            let v = (param.v.affine(self.beta2, 0.0)? + grad_sq.affine(1.0 - self.beta2, 0.0)?)?;
            param.m = m.detach();
            param.v = v.detach();

            let m_hat = param.m.affine(1.0 / bias1, 0.0)?;
            let v_hat = param.v.affine(1.0 / bias2, 0.0)?;
            let update = m_hat.div(&v_hat.sqrt()?.affine(1.0, self.eps)?)?;

            let theta = param.var.as_tensor();
            let decayed = theta.affine(1.0 - lr * self.weight_decay, 0.0)?;
            let next = (decayed - update.affine(lr, 0.0)?)?;
            param.var.set(&next.detach())?;
        }
        Ok(norm)
    }

    /// `(name, m, v)` for every tracked parameter, in registration order.
    pub fn moments(&self) -> Vec<(&str, &Tensor, &Tensor)> {
        self.params
            .iter()
            .map(|p| (p.name.as_str(), &p.m, &p.v))
            .collect()
    }

    /// Replace the moments of one parameter.
    pub fn set_moments(&mut self, name: &str, m: Tensor, v: Tensor) -> Result<()> {
        let Some(param) = self.params.iter_mut().find(|p| p.name == name) else {
            candle_core::bail!("no optimizer state for `{}`", name);
        };
        if m.dims() != param.m.dims() || v.dims() != param.v.dims() {
            candle_core::bail!("optimizer moment shape mismatch for `{}`", name);
        }
        param.m = m;
        param.v = v;
        Ok(())
    }

    pub fn set_step_count(&mut self, step: usize) {
        self.step = step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn config() -> TrainingConfig {
        TrainingConfig {
            weight_decay: 0.0,
            max_grad_norm: 0.0,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_minimizes_quadratic() {
        let x = Var::new(&[3f32, -2.0], &Device::Cpu).unwrap();
        let mut opt = AdamW::new(vec![("x".into(), x.clone())], &config()).unwrap();

        for _ in 0..500 {
            let loss = x.as_tensor().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            opt.step(&grads, 0.05).unwrap();
        }
        let values = x.as_tensor().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.abs() < 0.1), "{:?}", values);
        assert_eq!(opt.step_count(), 500);
    }

    #[test]
    fn test_clipping_bounds_first_update() {
        let x = Var::new(&[1000f32], &Device::Cpu).unwrap();
        let cfg = TrainingConfig {
            max_grad_norm: 1.0,
            weight_decay: 0.0,
            ..TrainingConfig::default()
        };
        let mut opt = AdamW::new(vec![("x".into(), x.clone())], &cfg).unwrap();
        let loss = x.as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let norm = opt.step(&grads, 0.1).unwrap();

        assert!((norm - 2000.0).abs() < 1e-3);
        // Adam's first step moves by ~lr regardless of gradient scale
        let after = x.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((1000.0 - after - 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_set_moments_checks_shape() {
        let x = Var::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let mut opt = AdamW::new(vec![("x".into(), x)], &config()).unwrap();
        let zeros = |n: usize| Tensor::zeros(n, candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(opt.set_moments("x", zeros(3), zeros(3)).is_err());
        assert!(opt.set_moments("y", zeros(2), zeros(2)).is_err());
        assert!(opt.set_moments("x", zeros(2), zeros(2)).is_ok());
        assert_eq!(opt.moments().len(), 1);
    }
}
