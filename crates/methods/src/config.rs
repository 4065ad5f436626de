//! Method-level hyperparameters.

use backbones::BackboneArgs;
use burn::prelude::*;

/// Optimizer arguments passed through to whichever optimizer is selected.
#[derive(Config, Debug)]
pub struct ExtraOptimizerArgs {
    /// SGD / LARS heavy-ball momentum. Zero disables it.
    #[config(default = 0.9)]
    pub momentum: f64,
    /// Nesterov momentum for SGD / LARS.
    #[config(default = false)]
    pub nesterov: bool,
    /// Adam(W) first-moment decay.
    #[config(default = 0.9)]
    pub beta_1: f32,
    /// Adam(W) second-moment decay.
    #[config(default = 0.999)]
    pub beta_2: f32,
    /// Adam(W) denominator epsilon.
    #[config(default = 1e-8)]
    pub epsilon: f32,
}

/// Configuration shared by every self-supervised method.
#[derive(Config, Debug)]
pub struct MethodConfig {
    /// Registered backbone name, e.g. `resnet18` or `vit_small`.
    pub backbone: String,
    /// Number of classes seen by the online linear classifier.
    pub num_classes: usize,
    /// Training length, used by the schedulers and the tau schedule.
    pub max_epochs: usize,
    /// Family-specific backbone construction arguments.
    #[config(default = "BackboneArgs::new()")]
    pub backbone_args: BackboneArgs,
    /// Output width of the large residual variants.
    #[config(default = 2048)]
    pub out_size: usize,
    #[config(default = 128)]
    pub batch_size: usize,
    /// One of `sgd`, `adam`, `adamw`.
    #[config(default = "String::from(\"sgd\")")]
    pub optimizer: String,
    #[config(default = "ExtraOptimizerArgs::new()")]
    pub extra_optimizer_args: ExtraOptimizerArgs,
    /// Base learning rate for the backbone group.
    #[config(default = 0.3)]
    pub lr: f64,
    /// Learning rate for the online classifier group(s).
    #[config(default = 0.3)]
    pub classifier_lr: f64,
    #[config(default = 1e-4)]
    pub weight_decay: f64,
    /// Wrap SGD with layer-wise adaptive rate scaling.
    #[config(default = false)]
    pub lars: bool,
    #[config(default = 1e-3)]
    pub eta_lars: f64,
    /// Clip the LARS adaptive rate to the group learning rate.
    #[config(default = false)]
    pub grad_clip_lars: bool,
    /// Skip LARS adaptation (and weight decay) for biases and norm parameters.
    #[config(default = false)]
    pub exclude_bias_n_norm: bool,
    /// One of `none`, `warmup_cosine`, `cosine`, `step`.
    #[config(default = "String::from(\"warmup_cosine\")")]
    pub scheduler: String,
    /// Epochs at which the `step` scheduler decays by 10x.
    pub lr_decay_steps: Option<Vec<usize>>,
    #[config(default = 0.0)]
    pub min_lr: f64,
    #[config(default = 3e-5)]
    pub warmup_start_lr: f64,
    #[config(default = 10)]
    pub warmup_epochs: usize,
    #[config(default = 2)]
    pub num_large_crops: usize,
    #[config(default = 0)]
    pub num_small_crops: usize,
    /// Accumulate train features and evaluate a weighted k-NN on validation.
    #[config(default = false)]
    pub knn_eval: bool,
    #[config(default = 20)]
    pub knn_k: usize,
    /// Micro-batches per optimizer step.
    pub accumulate_grad_batches: Option<usize>,
}

impl MethodConfig {
    pub fn num_crops(&self) -> usize {
        self.num_large_crops + self.num_small_crops
    }

    /// Rescale every learning rate by the accumulation factor.
    ///
    /// Applied exactly once, when the method is constructed.
    pub fn scaled_for_accumulation(mut self) -> Self {
        if let Some(factor) = self.accumulate_grad_batches.filter(|&n| n > 1) {
            let factor = factor as f64;
            self.lr *= factor;
            self.classifier_lr *= factor;
            self.min_lr *= factor;
            self.warmup_start_lr *= factor;
            tracing::warn!(
                factor,
                lr = self.lr,
                classifier_lr = self.classifier_lr,
                "Scaled learning rates by gradient accumulation factor"
            );
        }
        self
    }

    /// Optimizer steps per micro-batch divisor; 1 when accumulation is off.
    pub fn accumulation_factor(&self) -> usize {
        self.accumulate_grad_batches.unwrap_or(1).max(1)
    }
}

/// Configuration of a method with an EMA teacher.
#[derive(Config, Debug)]
pub struct MomentumMethodConfig {
    pub method: MethodConfig,
    /// Tau at the start of training.
    #[config(default = 0.99)]
    pub base_tau_momentum: f64,
    /// Tau reached at the end of training.
    #[config(default = 1.0)]
    pub final_tau_momentum: f64,
    /// Train a linear classifier on the momentum features too.
    #[config(default = false)]
    pub momentum_classifier: bool,
}
