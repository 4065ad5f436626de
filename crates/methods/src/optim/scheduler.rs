//! Epoch-level learning-rate schedules.
//!
//! Every schedule maps `(epoch, base_lr)` to a rate in closed form, so each
//! parameter group keeps its own base rate and a resumed run lands on the same
//! value as an uninterrupted one.

use std::f64::consts::PI;
use std::fmt::Debug;

pub trait LrSchedule: Debug + Send + Sync {
    /// Rate at `epoch` for a group whose initial rate is `base_lr`.
    fn lr_at(&self, epoch: usize, base_lr: f64) -> f64;

    /// Rates for every group, in group order.
    fn group_lrs(&self, epoch: usize, base_lrs: &[f64]) -> Vec<f64> {
        base_lrs.iter().map(|&base| self.lr_at(epoch, base)).collect()
    }
}

/// Linear warmup from `warmup_start_lr` to the base rate, then cosine decay
/// to `eta_min` at `max_epochs`.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmupCosine {
    pub warmup_epochs: usize,
    pub max_epochs: usize,
    pub warmup_start_lr: f64,
    pub eta_min: f64,
}

impl LrSchedule for WarmupCosine {
    fn lr_at(&self, epoch: usize, base_lr: f64) -> f64 {
        if epoch < self.warmup_epochs {
            let span = self.warmup_epochs.saturating_sub(1).max(1) as f64;
            self.warmup_start_lr + epoch as f64 * (base_lr - self.warmup_start_lr) / span
        } else {
            let decay = self.max_epochs.saturating_sub(self.warmup_epochs).max(1) as f64;
            let progress = ((epoch - self.warmup_epochs) as f64 / decay).min(1.0);
            self.eta_min + 0.5 * (base_lr - self.eta_min) * (1.0 + (PI * progress).cos())
        }
    }
}

/// Cosine annealing from the base rate to `eta_min` over `t_max` epochs.
#[derive(Debug, Clone, PartialEq)]
pub struct CosineAnnealing {
    pub t_max: usize,
    pub eta_min: f64,
}

impl LrSchedule for CosineAnnealing {
    fn lr_at(&self, epoch: usize, base_lr: f64) -> f64 {
        let progress = epoch as f64 / self.t_max.max(1) as f64;
        self.eta_min + (base_lr - self.eta_min) * (1.0 + (PI * progress).cos()) / 2.0
    }
}

/// Multiply by `gamma` at every milestone epoch reached.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiStep {
    pub milestones: Vec<usize>,
    pub gamma: f64,
}

impl MultiStep {
    pub fn new(milestones: Vec<usize>) -> Self {
        Self { milestones, gamma: 0.1 }
    }
}

impl LrSchedule for MultiStep {
    fn lr_at(&self, epoch: usize, base_lr: f64) -> f64 {
        let passed = self.milestones.iter().filter(|&&m| m <= epoch).count();
        base_lr * self.gamma.powi(passed as i32)
    }
}

/// Pins some groups to fixed rates after the inner schedule has run.
#[derive(Debug)]
pub struct StaticLr {
    inner: Box<dyn LrSchedule>,
    indices: Vec<usize>,
    lrs_to_replace: Vec<f64>,
}

impl StaticLr {
    pub fn new(inner: Box<dyn LrSchedule>, indices: Vec<usize>, lrs_to_replace: Vec<f64>) -> Self {
        debug_assert_eq!(indices.len(), lrs_to_replace.len());
        Self { inner, indices, lrs_to_replace }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl LrSchedule for StaticLr {
    fn lr_at(&self, epoch: usize, base_lr: f64) -> f64 {
        self.inner.lr_at(epoch, base_lr)
    }

    fn group_lrs(&self, epoch: usize, base_lrs: &[f64]) -> Vec<f64> {
        let mut lrs = self.inner.group_lrs(epoch, base_lrs);
        for (&idx, &lr) in self.indices.iter().zip(&self.lrs_to_replace) {
            if let Some(slot) = lrs.get_mut(idx) {
                *slot = lr;
            }
        }
        lrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-10
    }

    #[test]
    fn test_warmup_cosine() {
        let sched = WarmupCosine { warmup_epochs: 10, max_epochs: 110, warmup_start_lr: 0.0, eta_min: 0.0 };
        let base = 1.0;

        // Epoch 0 starts at warmup_start_lr
        let lr0 = sched.lr_at(0, base);
        assert!(close(lr0, 0.0), "Epoch 0: expected 0, got {lr0}");

        // Warmup reaches the base rate on its last epoch: 9 * 1/9
        let lr9 = sched.lr_at(9, base);
        assert!(close(lr9, base), "Epoch 9: expected {base}, got {lr9}");

        // Start of cosine: cos(0) keeps the base rate
        let lr10 = sched.lr_at(10, base);
        assert!(close(lr10, base), "Epoch 10: expected {base}, got {lr10}");

        // Cosine midpoint: progress 50/100
        let lr60 = sched.lr_at(60, base);
        assert!(close(lr60, 0.5), "Epoch 60: expected 0.5, got {lr60}");

        // End of training reaches eta_min and stays there
        assert!(close(sched.lr_at(110, base), 0.0));
        assert!(close(sched.lr_at(500, base), 0.0));
    }

    #[test]
    fn test_warmup_cosine_eta_min_and_start() {
        let sched = WarmupCosine { warmup_epochs: 3, max_epochs: 13, warmup_start_lr: 0.1, eta_min: 0.05 };
        assert!(close(sched.lr_at(0, 1.0), 0.1));
        // halfway through a 3-epoch warmup: 0.1 + 1 * 0.9 / 2
        assert!(close(sched.lr_at(1, 1.0), 0.55));
        assert!(close(sched.lr_at(13, 1.0), 0.05));
    }

    #[test]
    fn test_warmup_cosine_degenerate_lengths() {
        // no warmup, no decay window: no division by zero
        let sched = WarmupCosine { warmup_epochs: 0, max_epochs: 0, warmup_start_lr: 0.0, eta_min: 0.0 };
        assert!(sched.lr_at(0, 1.0).is_finite());
        let single = WarmupCosine { warmup_epochs: 1, max_epochs: 5, warmup_start_lr: 0.2, eta_min: 0.0 };
        assert!(close(single.lr_at(0, 1.0), 0.2));
    }

    #[test]
    fn test_cosine_annealing() {
        let sched = CosineAnnealing { t_max: 100, eta_min: 0.0 };
        assert!(close(sched.lr_at(0, 0.4), 0.4));
        assert!(close(sched.lr_at(50, 0.4), 0.2));
        assert!(close(sched.lr_at(100, 0.4), 0.0));
    }

    #[test]
    fn test_multistep() {
        let sched = MultiStep::new(vec![60, 80]);
        assert!(close(sched.lr_at(0, 1.0), 1.0));
        assert!(close(sched.lr_at(59, 1.0), 1.0));
        assert!(close(sched.lr_at(60, 1.0), 0.1));
        assert!(close(sched.lr_at(80, 1.0), 0.01));
    }

    #[test]
    fn test_group_lrs_use_each_base() {
        let sched = CosineAnnealing { t_max: 10, eta_min: 0.0 };
        let lrs = sched.group_lrs(5, &[0.4, 0.1]);
        assert!(close(lrs[0], 0.2));
        assert!(close(lrs[1], 0.05));
    }

    #[test]
    fn test_static_lr_overrides_after_inner() {
        let inner = Box::new(CosineAnnealing { t_max: 10, eta_min: 0.0 });
        let sched = StaticLr::new(inner, vec![1], vec![0.3]);
        for epoch in [0, 3, 7, 10] {
            let lrs = sched.group_lrs(epoch, &[0.3, 0.5, 0.3]);
            assert!(close(lrs[1], 0.3), "epoch {epoch}: static group got {}", lrs[1]);
        }
        let lrs = sched.group_lrs(10, &[0.3, 0.5, 0.3]);
        assert!(close(lrs[0], 0.0));
        assert!(close(lrs[2], 0.0));
    }
}
