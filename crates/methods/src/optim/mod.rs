//! Parameter groups, per-group optimizers and scheduler construction.
//!
//! Each [`ParamGroup`] gets its own optimizer instance, configured with the
//! group's weight decay and stepped with the group's learning rate and only
//! the group's gradients. Gradients are split out of the backward pass by
//! parameter id and accumulated per group until the host takes an optimizer
//! step.

pub mod lars;
pub mod scheduler;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use burn::module::{AutodiffModule, Module, ModuleVisitor, ParamId};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, AdamWConfig, GradientsAccumulator, GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder, RecorderError};
use burn::tensor::backend::AutodiffBackend;

use crate::config::MethodConfig;
use crate::error::MethodError;

use self::lars::LarsConfig;
use self::scheduler::{CosineAnnealing, LrSchedule, MultiStep, StaticLr, WarmupCosine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
    AdamW,
}

impl FromStr for OptimizerKind {
    type Err = MethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "adamw" => Ok(OptimizerKind::AdamW),
            other => Err(MethodError::UnknownOptimizer(other.to_string())),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => write!(f, "sgd"),
            OptimizerKind::Adam => write!(f, "adam"),
            OptimizerKind::AdamW => write!(f, "adamw"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    None,
    WarmupCosine,
    Cosine,
    Step,
}

impl FromStr for SchedulerKind {
    type Err = MethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SchedulerKind::None),
            "warmup_cosine" => Ok(SchedulerKind::WarmupCosine),
            "cosine" => Ok(SchedulerKind::Cosine),
            "step" => Ok(SchedulerKind::Step),
            other => Err(MethodError::UnknownScheduler(other.to_string())),
        }
    }
}

/// A named set of parameters sharing optimizer settings.
///
/// `None` for `lr` / `weight_decay` means the method-level default. Group order
/// is significant: static-LR overrides refer to groups by index.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub name: String,
    pub params: Vec<ParamId>,
    pub lr: Option<f64>,
    pub weight_decay: Option<f64>,
    /// Exempt from the scheduler; pinned to the base learning rate.
    pub static_lr: bool,
}

impl ParamGroup {
    pub fn new(name: impl Into<String>, params: Vec<ParamId>) -> Self {
        Self { name: name.into(), params, lr: None, weight_decay: None, static_lr: false }
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = Some(lr);
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = Some(weight_decay);
        self
    }

    pub fn with_static_lr(mut self, static_lr: bool) -> Self {
        self.static_lr = static_lr;
        self
    }
}

struct LearnableIds {
    ids: Vec<ParamId>,
}

impl<B: Backend> ModuleVisitor<B> for LearnableIds {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if tensor.is_require_grad() {
            self.ids.push(id);
        }
    }
}

/// Ids of every gradient-tracked float parameter of `module`, in traversal order.
pub fn learnable_param_ids<B: Backend, M: Module<B>>(module: &M) -> Vec<ParamId> {
    let mut visitor = LearnableIds { ids: Vec::new() };
    module.visit(&mut visitor);
    visitor.ids
}

/// Moves the gradients of one group's parameters into a [`GradientsParams`].
struct GradientSplitter<'a, B: AutodiffBackend> {
    grads: &'a mut B::Gradients,
    ids: &'a HashSet<ParamId>,
    out: GradientsParams,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientSplitter<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if !self.ids.contains(&id) {
            return;
        }
        if let Some(grad) = tensor.grad_remove(self.grads) {
            self.out.register::<B::InnerBackend, D>(id, grad);
        }
    }
}

/// Object-safe view of a burn optimizer, so groups can mix optimizer types.
pub trait GroupStep<M, B>: Send
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M;

    fn save_record(&self, path: PathBuf) -> Result<(), RecorderError>;

    fn load_record(
        self: Box<Self>,
        path: PathBuf,
        device: &B::Device,
    ) -> Result<Box<dyn GroupStep<M, B>>, RecorderError>;
}

impl<M, B, O> GroupStep<M, B> for O
where
    M: AutodiffModule<B> + 'static,
    B: AutodiffBackend,
    O: Optimizer<M, B> + 'static,
{
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        Optimizer::step(self, lr, module, grads)
    }

    fn save_record(&self, path: PathBuf) -> Result<(), RecorderError> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        Recorder::<B>::record(&recorder, self.to_record(), path)?;
        Ok(())
    }

    fn load_record(
        self: Box<Self>,
        path: PathBuf,
        device: &B::Device,
    ) -> Result<Box<dyn GroupStep<M, B>>, RecorderError> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let record = Recorder::<B>::load(&recorder, path, device)?;
        Ok(Box::new(Optimizer::load_record(*self, record)))
    }
}

/// One group's optimizer, gradient accumulator and base learning rate.
pub struct GroupOptimizer<M, B>
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    group: ParamGroup,
    ids: HashSet<ParamId>,
    base_lr: f64,
    optim: Box<dyn GroupStep<M, B>>,
    accumulator: GradientsAccumulator<M>,
    pending: usize,
}

impl<M, B> GroupOptimizer<M, B>
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    pub fn new(group: ParamGroup, base_lr: f64, optim: Box<dyn GroupStep<M, B>>) -> Self {
        let ids = group.params.iter().copied().collect();
        Self { group, ids, base_lr, optim, accumulator: GradientsAccumulator::new(), pending: 0 }
    }

    pub fn group(&self) -> &ParamGroup {
        &self.group
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }
}

/// Optimizer over every parameter group of a model.
pub struct MethodOptimizer<M, B>
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    groups: Vec<GroupOptimizer<M, B>>,
}

impl<M, B> MethodOptimizer<M, B>
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    pub fn new(groups: Vec<GroupOptimizer<M, B>>) -> Self {
        Self { groups }
    }

    pub fn groups(&self) -> &[GroupOptimizer<M, B>] {
        &self.groups
    }

    pub fn base_lrs(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.base_lr).collect()
    }

    /// Split one backward pass by group and add it to each group's accumulator.
    pub fn accumulate(&mut self, model: &M, mut grads: B::Gradients) {
        for group in &mut self.groups {
            let mut splitter = GradientSplitter::<B> {
                grads: &mut grads,
                ids: &group.ids,
                out: GradientsParams::new(),
            };
            model.visit(&mut splitter);
            group.accumulator.accumulate(model, splitter.out);
            group.pending += 1;
        }
    }

    /// Whether any gradients are waiting for a step.
    pub fn has_pending(&self) -> bool {
        self.groups.iter().any(|g| g.pending > 0)
    }

    /// Apply the accumulated gradients of every group at the given rates.
    pub fn step(&mut self, mut model: M, lrs: &[f64]) -> M {
        debug_assert_eq!(lrs.len(), self.groups.len());
        for (group, &lr) in self.groups.iter_mut().zip(lrs) {
            if group.pending == 0 {
                continue;
            }
            let grads = group.accumulator.grads();
            group.pending = 0;
            model = group.optim.step(lr, model, grads);
        }
        model
    }

    /// Save every group's optimizer state as `{dir}/optimizer_{group}`.
    pub fn save(&self, dir: &Path) -> Result<(), RecorderError> {
        for group in &self.groups {
            group.optim.save_record(dir.join(format!("optimizer_{}", group.group.name)))?;
        }
        Ok(())
    }

    /// Restore state written by [`MethodOptimizer::save`].
    pub fn load(self, dir: &Path, device: &B::Device) -> Result<Self, RecorderError> {
        let groups = self
            .groups
            .into_iter()
            .map(|mut group| {
                let path = dir.join(format!("optimizer_{}", group.group.name));
                group.optim = group.optim.load_record(path, device)?;
                Ok(group)
            })
            .collect::<Result<Vec<_>, RecorderError>>()?;
        Ok(Self { groups })
    }
}

/// The optimizer and optional scheduler of a method.
pub struct ConfiguredOptimizer<M, B>
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    pub optimizer: MethodOptimizer<M, B>,
    pub scheduler: Option<Box<dyn LrSchedule>>,
}

impl<M, B> ConfiguredOptimizer<M, B>
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    /// Learning rate of every group at `epoch`.
    pub fn lrs_at(&self, epoch: usize) -> Vec<f64> {
        let base = self.optimizer.base_lrs();
        match &self.scheduler {
            Some(scheduler) => scheduler.group_lrs(epoch, &base),
            None => base,
        }
    }
}

fn build_scheduler(
    config: &MethodConfig,
    kind: SchedulerKind,
) -> Result<Option<Box<dyn LrSchedule>>, MethodError> {
    let scheduler: Box<dyn LrSchedule> = match kind {
        SchedulerKind::None => return Ok(None),
        SchedulerKind::WarmupCosine => Box::new(WarmupCosine {
            warmup_epochs: config.warmup_epochs,
            max_epochs: config.max_epochs,
            warmup_start_lr: config.warmup_start_lr,
            eta_min: config.min_lr,
        }),
        SchedulerKind::Cosine => Box::new(CosineAnnealing { t_max: config.max_epochs, eta_min: config.min_lr }),
        SchedulerKind::Step => match &config.lr_decay_steps {
            Some(steps) if !steps.is_empty() => Box::new(MultiStep::new(steps.clone())),
            _ => return Err(MethodError::MissingDecaySteps),
        },
    };
    Ok(Some(scheduler))
}

fn build_group_optimizer<M, B>(
    config: &MethodConfig,
    kind: OptimizerKind,
    weight_decay: f64,
) -> Box<dyn GroupStep<M, B>>
where
    M: AutodiffModule<B> + 'static,
    B: AutodiffBackend,
{
    let extra = &config.extra_optimizer_args;
    let decay = (weight_decay > 0.0).then(|| WeightDecayConfig::new(weight_decay as f32));
    match kind {
        OptimizerKind::Sgd if config.lars => Box::new(
            LarsConfig::new()
                .with_eta(config.eta_lars)
                .with_clip(config.grad_clip_lars)
                .with_exclude_bias_n_norm(config.exclude_bias_n_norm)
                .with_weight_decay(weight_decay)
                .with_momentum(extra.momentum)
                .with_nesterov(extra.nesterov)
                .init::<B, M>(),
        ),
        OptimizerKind::Sgd => {
            let momentum = (extra.momentum > 0.0).then(|| {
                MomentumConfig::new()
                    .with_momentum(extra.momentum)
                    .with_dampening(0.0)
                    .with_nesterov(extra.nesterov)
            });
            Box::new(SgdConfig::new().with_weight_decay(decay).with_momentum(momentum).init::<B, M>())
        }
        OptimizerKind::Adam => Box::new(
            AdamConfig::new()
                .with_beta_1(extra.beta_1)
                .with_beta_2(extra.beta_2)
                .with_epsilon(extra.epsilon)
                .with_weight_decay(decay)
                .init::<B, M>(),
        ),
        OptimizerKind::AdamW => Box::new(
            AdamWConfig::new()
                .with_beta_1(extra.beta_1)
                .with_beta_2(extra.beta_2)
                .with_epsilon(extra.epsilon)
                .with_weight_decay(weight_decay as f32)
                .init::<B, M>(),
        ),
    }
}

/// Check optimizer, LARS and scheduler settings without building anything.
pub fn validate_optimizer_settings(config: &MethodConfig) -> Result<(OptimizerKind, SchedulerKind), MethodError> {
    let kind: OptimizerKind = config.optimizer.parse()?;
    if config.lars && kind != OptimizerKind::Sgd {
        return Err(MethodError::LarsRequiresSgd(config.optimizer.clone()));
    }
    let scheduler: SchedulerKind = config.scheduler.parse()?;
    if scheduler == SchedulerKind::Step && config.lr_decay_steps.as_ref().map_or(true, Vec::is_empty) {
        return Err(MethodError::MissingDecaySteps);
    }
    Ok((kind, scheduler))
}

/// Build the optimizer and scheduler for `groups`.
///
/// Groups flagged `static_lr` keep the base learning rate at every epoch: the
/// scheduler's rates are computed first and then overwritten for those indices.
pub fn configure_optimizers<M, B>(
    config: &MethodConfig,
    groups: Vec<ParamGroup>,
) -> Result<ConfiguredOptimizer<M, B>, MethodError>
where
    M: AutodiffModule<B> + 'static,
    B: AutodiffBackend,
{
    let static_indices: Vec<usize> =
        groups.iter().enumerate().filter(|(_, g)| g.static_lr).map(|(i, _)| i).collect();

    let (kind, scheduler_kind) = validate_optimizer_settings(config)?;
    let scheduler = match build_scheduler(config, scheduler_kind)? {
        Some(inner) if !static_indices.is_empty() => {
            let lrs = vec![config.lr; static_indices.len()];
            Some(Box::new(StaticLr::new(inner, static_indices.clone(), lrs)) as Box<dyn LrSchedule>)
        }
        other => other,
    };

    let groups = groups
        .into_iter()
        .map(|group| {
            let lr = group.lr.unwrap_or(config.lr);
            let weight_decay = group.weight_decay.unwrap_or(config.weight_decay);
            tracing::debug!(group = %group.name, params = group.params.len(), lr, weight_decay, "Parameter group");
            let optim = build_group_optimizer::<M, B>(config, kind, weight_decay);
            GroupOptimizer::new(group, lr, optim)
        })
        .collect();

    tracing::info!(
        optimizer = %kind,
        lars = config.lars,
        scheduler = %config.scheduler,
        static_groups = static_indices.len(),
        "Configured optimizer"
    );

    Ok(ConfiguredOptimizer { optimizer: MethodOptimizer::new(groups), scheduler })
}
