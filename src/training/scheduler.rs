use serde::{Deserialize, Serialize};

/// Cosine annealing with warm restarts, stepped once per optimizer step.
///
/// The first cycle lasts `t_0` steps; each following cycle is `t_mult`
/// times longer. Within a cycle the rate decays from `base_lr` to `eta_min`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosineWarmRestarts {
    pub base_lr: f64,
    pub eta_min: f64,
    pub t_0: usize,
    pub t_mult: usize,
    /// Steps taken in the current cycle
    pub t_cur: usize,
    /// Length of the current cycle
    pub t_i: usize,
    /// Completed restarts
    pub cycle: usize,
}

impl CosineWarmRestarts {
    pub fn new(base_lr: f64, t_0: usize, t_mult: usize, eta_min: f64) -> Self {
        let t_0 = t_0.max(1);
        Self {
            base_lr,
            eta_min,
            t_0,
            t_mult: t_mult.max(1),
            t_cur: 0,
            t_i: t_0,
            cycle: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        let progress = self.t_cur as f64 / self.t_i as f64;
        self.eta_min
            + (self.base_lr - self.eta_min) * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
    }

    /// Advance one step; returns the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.t_cur += 1;
        if self.t_cur >= self.t_i {
            self.t_cur = 0;
            self.t_i = self.t_i.saturating_mul(self.t_mult);
            self.cycle += 1;
        }
        self.lr()
    }
}
