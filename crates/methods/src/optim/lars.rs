//! Layer-wise adaptive rate scaling on top of SGD.
//!
//! For each parameter tensor the gradient is rescaled by the trust ratio
//! `eta * |w| / (|g| + wd * |w| + eps)` (optionally clipped to
//! `min(ratio / lr, 1)`), with weight decay folded into the gradient, before
//! the usual heavy-ball SGD update.

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::SimpleOptimizer;
use burn::prelude::*;
use burn::record::Record;
use burn::tensor::backend::AutodiffBackend;
use burn::LearningRate;

#[derive(Config, Debug)]
pub struct LarsConfig {
    /// Trust coefficient.
    #[config(default = 1e-3)]
    pub eta: f64,
    /// Clip the adaptive rate so it never exceeds the group learning rate.
    #[config(default = false)]
    pub clip: bool,
    /// Leave 1-D tensors (biases, norm scales) unadapted and undecayed.
    #[config(default = false)]
    pub exclude_bias_n_norm: bool,
    #[config(default = 0.0)]
    pub weight_decay: f64,
    #[config(default = 0.9)]
    pub momentum: f64,
    #[config(default = false)]
    pub nesterov: bool,
    #[config(default = 1e-8)]
    pub epsilon: f64,
}

impl LarsConfig {
    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(&self) -> OptimizerAdaptor<Lars, M, B> {
        OptimizerAdaptor::from(Lars {
            eta: self.eta,
            clip: self.clip,
            exclude_bias_n_norm: self.exclude_bias_n_norm,
            weight_decay: self.weight_decay,
            momentum: self.momentum,
            nesterov: self.nesterov,
            epsilon: self.epsilon,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Lars {
    eta: f64,
    clip: bool,
    exclude_bias_n_norm: bool,
    weight_decay: f64,
    momentum: f64,
    nesterov: bool,
    epsilon: f64,
}

/// Momentum buffer of one parameter tensor.
#[derive(Record, Clone)]
pub struct LarsState<B: Backend, const D: usize> {
    pub velocity: Tensor<B, D>,
}

impl Lars {
    /// Trust-ratio-scaled gradient with weight decay folded in.
    ///
    /// Tensors with a zero norm, or a zero gradient norm, keep the raw gradient.
    fn adapt<B: Backend, const D: usize>(
        &self,
        lr: LearningRate,
        param: &Tensor<B, D>,
        grad: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let p_norm = l2_norm(param.clone());
        let g_norm = l2_norm(grad.clone());
        if p_norm == 0.0 || g_norm == 0.0 {
            return grad;
        }
        let mut ratio = self.eta * p_norm / (g_norm + p_norm * self.weight_decay + self.epsilon);
        if self.clip {
            ratio = (ratio / lr).min(1.0);
        }
        grad.add(param.clone().mul_scalar(self.weight_decay)).mul_scalar(ratio)
    }
}

impl<B: Backend> SimpleOptimizer<B> for Lars {
    type State<const D: usize> = LarsState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let grad = if self.exclude_bias_n_norm && D == 1 {
            grad
        } else {
            self.adapt(lr, &tensor, grad)
        };

        let (update, state) = if self.momentum > 0.0 {
            let velocity = match state {
                Some(state) => state.velocity.mul_scalar(self.momentum).add(grad.clone()),
                None => grad.clone(),
            };
            let update = if self.nesterov {
                grad.add(velocity.clone().mul_scalar(self.momentum))
            } else {
                velocity.clone()
            };
            (update, Some(LarsState { velocity }))
        } else {
            (grad, None)
        };

        (tensor.sub(update.mul_scalar(lr)), state)
    }

    fn to_device<const D: usize>(mut state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        state.velocity = state.velocity.to_device(device);
        state
    }
}

fn l2_norm<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> f64 {
    let norm: f32 = tensor.powf_scalar(2.0).sum().sqrt().into_scalar().elem();
    norm as f64
}
