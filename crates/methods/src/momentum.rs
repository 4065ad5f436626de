//! EMA teacher updates and the cosine tau schedule.
//!
//! The momentum side of a pair is never trained by backpropagation: it is
//! overwritten with `tau * momentum + (1 - tau) * online` after each optimizer
//! step, and tau itself rises from `base_tau` to `final_tau` over training.

use std::f64::consts::PI;

use burn::module::{Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::error::MethodError;

/// Named (online, momentum) relation. The owning model resolves the names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MomentumPair {
    pub online: &'static str,
    pub momentum: &'static str,
}

/// Models that carry EMA copies of some of their sub-modules.
pub trait MomentumPairs<B: AutodiffBackend>: Sized {
    fn momentum_pairs(&self) -> Vec<MomentumPair>;

    /// EMA-update the momentum side of `pair` from its online side.
    fn update_pair(self, pair: &MomentumPair, updater: &MomentumUpdater) -> Result<Self, MethodError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MomentumUpdater {
    base_tau: f64,
    final_tau: f64,
    cur_tau: f64,
}

impl MomentumUpdater {
    /// Requires `0 <= base_tau <= final_tau <= 1`.
    pub fn new(base_tau: f64, final_tau: f64) -> Result<Self, MethodError> {
        let in_range = (0.0..=1.0).contains(&base_tau) && (0.0..=1.0).contains(&final_tau);
        if !in_range || base_tau > final_tau {
            return Err(MethodError::InvalidTau { base: base_tau, final_tau });
        }
        Ok(Self { base_tau, final_tau, cur_tau: base_tau })
    }

    pub fn base_tau(&self) -> f64 {
        self.base_tau
    }

    pub fn final_tau(&self) -> f64 {
        self.final_tau
    }

    pub fn cur_tau(&self) -> f64 {
        self.cur_tau
    }

    /// Move every learnable float tensor of `momentum` towards its counterpart
    /// in `online`. Tensors are matched by traversal order; tensors that are not
    /// learnable in `online` (running statistics, frozen parameters) are kept.
    pub fn update<B: AutodiffBackend, M: Module<B>>(&self, online: &M, momentum: M) -> Result<M, MethodError> {
        let online = collect_floats(online)?;
        check_structure(&online, &momentum)?;
        let mut mapper = EmaMapper { online: online.into_iter(), tau: self.cur_tau, copy_frozen: false };
        Ok(momentum.map(&mut mapper).no_grad())
    }

    /// `cur_tau = final - (final - base) * (cos(pi * cur / max) + 1) / 2`.
    pub fn update_tau(&mut self, cur_step: usize, max_steps: usize) -> Result<f64, MethodError> {
        if max_steps == 0 {
            return Err(MethodError::ZeroMaxSteps);
        }
        let progress = cur_step as f64 / max_steps as f64;
        self.cur_tau =
            self.final_tau - (self.final_tau - self.base_tau) * ((PI * progress).cos() + 1.0) / 2.0;
        Ok(self.cur_tau)
    }
}

/// Copy every float tensor of `online` (parameters and running statistics) into
/// `momentum` and freeze it.
pub fn initialize_momentum_params<B: AutodiffBackend, M: Module<B>>(
    online: &M,
    momentum: M,
) -> Result<M, MethodError> {
    let online = collect_floats(online)?;
    check_structure(&online, &momentum)?;
    let mut mapper = EmaMapper { online: online.into_iter(), tau: 0.0, copy_frozen: true };
    Ok(momentum.map(&mut mapper).no_grad())
}

/// Edge trigger on the host's optimizer-step counter.
///
/// Fires once per increase of `global_step`, so micro-batches inside one
/// accumulation window do not repeat the EMA update.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepLatch {
    last_step: usize,
}

impl StepLatch {
    pub fn reset(&mut self) {
        self.last_step = 0;
    }

    pub fn last_step(&self) -> usize {
        self.last_step
    }

    /// Record `global_step`; true if it advanced since the last call.
    pub fn observe(&mut self, global_step: usize) -> bool {
        let fired = global_step > self.last_step;
        self.last_step = global_step;
        fired
    }
}

struct CollectedFloat<B: Backend> {
    dims: Vec<usize>,
    values: Tensor<B, 1>,
    learnable: bool,
}

struct FloatCollector<B: Backend> {
    floats: Vec<CollectedFloat<B>>,
}

impl<B: Backend> ModuleVisitor<B> for FloatCollector<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let dims = tensor.dims().to_vec();
        let numel = dims.iter().product::<usize>();
        self.floats.push(CollectedFloat {
            dims,
            values: tensor.clone().detach().reshape([numel]),
            learnable: tensor.is_require_grad(),
        });
    }
}

struct ShapeCollector {
    dims: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.dims.push(tensor.dims().to_vec());
    }
}

fn collect_floats<B: Backend, M: Module<B>>(module: &M) -> Result<Vec<CollectedFloat<B>>, MethodError> {
    let mut collector = FloatCollector { floats: Vec::new() };
    module.visit(&mut collector);
    if collector.floats.is_empty() {
        return Err(MethodError::MomentumStructure("online module has no float tensors".into()));
    }
    Ok(collector.floats)
}

fn check_structure<B: Backend, M: Module<B>>(
    online: &[CollectedFloat<B>],
    momentum: &M,
) -> Result<(), MethodError> {
    let mut shapes = ShapeCollector { dims: Vec::new() };
    momentum.visit(&mut shapes);
    if shapes.dims.len() != online.len() {
        return Err(MethodError::MomentumStructure(format!(
            "online has {} float tensors, momentum has {}",
            online.len(),
            shapes.dims.len()
        )));
    }
    for (i, (o, m)) in online.iter().zip(&shapes.dims).enumerate() {
        if &o.dims != m {
            return Err(MethodError::MomentumStructure(format!(
                "tensor {i}: online shape {:?} != momentum shape {m:?}",
                o.dims
            )));
        }
    }
    Ok(())
}

struct EmaMapper<B: Backend> {
    online: std::vec::IntoIter<CollectedFloat<B>>,
    tau: f64,
    copy_frozen: bool,
}

impl<B: Backend> ModuleMapper<B> for EmaMapper<B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        // structure was checked before mapping
        let Some(online) = self.online.next() else {
            return tensor;
        };
        if !online.learnable && !self.copy_frozen {
            return tensor;
        }
        let online = online.values.reshape(tensor.dims());
        tensor.detach().mul_scalar(self.tau).add(online.mul_scalar(1.0 - self.tau))
    }
}
