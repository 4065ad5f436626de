//! A [`BaseMethod`] with an EMA copy of its backbone.
//!
//! The momentum backbone is built with the same architecture, starts as an
//! exact copy of the online one and is only ever written by the momentum
//! updater after optimizer steps. An optional linear classifier on momentum
//! features is trained alongside the online one.

use backbones::Backbone;
use burn::module::AutodiffModule;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::base::{BaseMethod, BaseModel, TOP_K};
use crate::batch::{StepLoss, TrainBatch, TrainingStepOutput, ValBatch, ValidationStepOutput};
use crate::bridge::scalar_to_f64;
use crate::config::{MethodConfig, MomentumMethodConfig};
use crate::error::MethodError;
use crate::eval::{accuracy_at_k, weighted_mean};
use crate::logging::{LogOptions, MetricSink};
use crate::loss::cross_entropy_with_ignore;
use crate::momentum::{initialize_momentum_params, MomentumPair, MomentumPairs, MomentumUpdater, StepLatch};
use crate::optim::{learnable_param_ids, ParamGroup};
use crate::policy::{TrainerState, TrainingPolicy};

#[derive(Module, Debug)]
pub struct MomentumModel<B: Backend> {
    pub base: BaseModel<B>,
    pub momentum_backbone: Backbone<B>,
    pub momentum_classifier: Option<Linear<B>>,
}

/// Momentum-side outputs for one crop.
#[derive(Debug, Clone)]
pub struct MomentumStepOutput<B: Backend> {
    pub feats: Tensor<B, 2>,
    pub logits: Option<Tensor<B, 2>>,
    pub loss: Option<Tensor<B, 1>>,
    pub acc1: Option<f64>,
    pub acc5: Option<f64>,
}

impl<B: Backend> MomentumModel<B> {
    /// Momentum features (no gradient) and, if present, momentum classifier scores.
    pub fn momentum_step(&self, images: Tensor<B, 4>, targets: Tensor<B, 1, Int>) -> MomentumStepOutput<B> {
        let feats = self.momentum_backbone.forward(images.detach()).detach();
        match &self.momentum_classifier {
            Some(classifier) => {
                let logits = classifier.forward(feats.clone());
                let loss = cross_entropy_with_ignore(logits.clone(), targets.clone());
                let acc = accuracy_at_k(logits.clone().detach(), targets, &TOP_K);
                MomentumStepOutput {
                    feats,
                    logits: Some(logits),
                    loss: Some(loss),
                    acc1: Some(acc[0]),
                    acc5: Some(acc[1]),
                }
            }
            None => MomentumStepOutput { feats, logits: None, loss: None, acc1: None, acc5: None },
        }
    }
}

impl<B: AutodiffBackend> MomentumPairs<B> for MomentumModel<B> {
    fn momentum_pairs(&self) -> Vec<MomentumPair> {
        vec![MomentumPair { online: "backbone", momentum: "momentum_backbone" }]
    }

    fn update_pair(self, pair: &MomentumPair, updater: &MomentumUpdater) -> Result<Self, MethodError> {
        match (pair.online, pair.momentum) {
            ("backbone", "momentum_backbone") => {
                let momentum_backbone = updater.update(&self.base.backbone, self.momentum_backbone)?;
                Ok(Self { base: self.base, momentum_backbone, momentum_classifier: self.momentum_classifier })
            }
            (online, momentum) => {
                Err(MethodError::MomentumStructure(format!("no momentum pair {online} -> {momentum}")))
            }
        }
    }
}

/// Training step output of [`MomentumMethod`].
#[derive(Debug, Clone)]
pub struct MomentumTrainingStepOutput<B: Backend> {
    pub base: TrainingStepOutput<B>,
    /// One tensor per large crop.
    pub momentum_feats: Vec<Tensor<B, 2>>,
    pub momentum_logits: Option<Vec<Tensor<B, 2>>>,
    /// Class loss plus the momentum classifier loss, when there is one.
    pub loss: Tensor<B, 1>,
}

impl<B: Backend> StepLoss<B> for MomentumTrainingStepOutput<B> {
    fn loss(&self) -> Tensor<B, 1> {
        self.loss.clone()
    }
}

/// Momentum-classifier validation statistics of one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentumValOutput {
    pub batch_size: usize,
    pub momentum_val_loss: f64,
    pub momentum_val_acc1: f64,
    pub momentum_val_acc5: f64,
}

#[derive(Debug)]
pub struct MomentumMethod<B: AutodiffBackend> {
    base: BaseMethod<B>,
    momentum_classifier: bool,
    updater: MomentumUpdater,
    latch: StepLatch,
}

impl<B: AutodiffBackend> MomentumMethod<B> {
    pub fn new(config: MomentumMethodConfig) -> Result<Self, MethodError> {
        let updater = MomentumUpdater::new(config.base_tau_momentum, config.final_tau_momentum)?;
        let base = BaseMethod::new(config.method)?;
        tracing::info!(
            base_tau = config.base_tau_momentum,
            final_tau = config.final_tau_momentum,
            momentum_classifier = config.momentum_classifier,
            "Momentum method"
        );
        Ok(Self { base, momentum_classifier: config.momentum_classifier, updater, latch: StepLatch::default() })
    }

    pub fn base(&self) -> &BaseMethod<B> {
        &self.base
    }

    pub fn updater(&self) -> &MomentumUpdater {
        &self.updater
    }

    pub fn latch(&self) -> &StepLatch {
        &self.latch
    }

    /// Online model plus momentum backbone copied from it.
    pub fn build_model(&self, device: &B::Device) -> Result<MomentumModel<B>, MethodError> {
        let base = self.base.build_model(device)?;
        let momentum_backbone = initialize_momentum_params(&base.backbone, self.base.build_backbone(device)?)?;
        let momentum_classifier = self
            .momentum_classifier
            .then(|| LinearConfig::new(self.base.features_dim(), self.base.config().num_classes).init(device));
        Ok(MomentumModel { base, momentum_backbone, momentum_classifier })
    }

    /// Base groups, then the momentum classifier (`classifier_lr`, no weight decay).
    pub fn param_groups(&self, model: &MomentumModel<B>) -> Vec<ParamGroup> {
        let mut groups = self.base.param_groups(&model.base);
        if let Some(classifier) = &model.momentum_classifier {
            groups.push(
                ParamGroup::new("momentum_classifier", learnable_param_ids(classifier))
                    .with_lr(self.base.config().classifier_lr)
                    .with_weight_decay(0.0),
            );
        }
        groups
    }

    pub fn train_step(
        &mut self,
        model: &MomentumModel<B>,
        batch: &TrainBatch<B>,
        sink: &mut dyn MetricSink,
    ) -> Result<MomentumTrainingStepOutput<B>, MethodError> {
        let base = self.base.train_step(&model.base, batch, sink)?;

        let crops = batch.crops.to_vec();
        let outs: Vec<MomentumStepOutput<B>> = crops[..self.base.config().num_large_crops]
            .iter()
            .map(|x| model.momentum_step(x.clone(), batch.targets.clone()))
            .collect();

        let mut loss = base.loss.clone();
        let momentum_logits = if model.momentum_classifier.is_some() {
            let n = outs.len() as f64;
            let class_loss = Tensor::cat(outs.iter().filter_map(|o| o.loss.clone()).collect(), 0).mean();
            let acc1 = outs.iter().filter_map(|o| o.acc1).sum::<f64>() / n;
            let acc5 = outs.iter().filter_map(|o| o.acc5).sum::<f64>() / n;
            sink.log_dict(
                &[
                    ("train_momentum_class_loss", scalar_to_f64(class_loss.clone())),
                    ("train_momentum_acc1", acc1),
                    ("train_momentum_acc5", acc5),
                ],
                LogOptions::EPOCH_SYNCED,
            );
            loss = loss + class_loss;
            Some(outs.iter().filter_map(|o| o.logits.clone()).collect())
        } else {
            None
        };

        Ok(MomentumTrainingStepOutput {
            base,
            momentum_feats: outs.into_iter().map(|o| o.feats).collect(),
            momentum_logits,
            loss,
        })
    }

    /// Once per optimizer step: EMA-update every pair, log tau, advance tau.
    pub fn after_batch(
        &mut self,
        mut model: MomentumModel<B>,
        state: &TrainerState,
        sink: &mut dyn MetricSink,
    ) -> Result<MomentumModel<B>, MethodError> {
        if !self.latch.observe(state.global_step) {
            return Ok(model);
        }
        for pair in model.momentum_pairs() {
            model = model.update_pair(&pair, &self.updater)?;
        }
        sink.log("tau", self.updater.cur_tau(), LogOptions::default());

        let cur_step = state.global_step * state.accumulate_grad_batches;
        let max_steps = state.num_training_batches * state.max_epochs;
        let tau = self.updater.update_tau(cur_step, max_steps)?;
        tracing::debug!(global_step = state.global_step, tau, "Momentum update");
        Ok(model)
    }

    pub fn val_step(
        &mut self,
        model: &MomentumModel<B::InnerBackend>,
        batch: &ValBatch<B::InnerBackend>,
        state: &TrainerState,
    ) -> (ValidationStepOutput, Option<MomentumValOutput>) {
        let online = self.base.val_step(&model.base, batch, state);
        let out = model.momentum_step(batch.images.clone(), batch.targets.clone());
        let momentum = match (out.loss, out.acc1, out.acc5) {
            (Some(loss), Some(acc1), Some(acc5)) => Some(MomentumValOutput {
                batch_size: batch.batch_size(),
                momentum_val_loss: scalar_to_f64(loss),
                momentum_val_acc1: acc1,
                momentum_val_acc5: acc5,
            }),
            _ => None,
        };
        (online, momentum)
    }

    pub fn val_epoch_end(
        &mut self,
        outs: Vec<(ValidationStepOutput, Option<MomentumValOutput>)>,
        state: &TrainerState,
        sink: &mut dyn MetricSink,
    ) {
        let (online, momentum): (Vec<_>, Vec<_>) = outs.into_iter().unzip();
        self.base.val_epoch_end(&online, state, sink);

        if !self.momentum_classifier {
            return;
        }
        let momentum: Vec<MomentumValOutput> = momentum.into_iter().flatten().collect();
        let metrics: Vec<(&str, f64)> = [
            ("momentum_val_loss", weighted_mean(&momentum, |o| o.momentum_val_loss, |o| o.batch_size)),
            ("momentum_val_acc1", weighted_mean(&momentum, |o| o.momentum_val_acc1, |o| o.batch_size)),
            ("momentum_val_acc5", weighted_mean(&momentum, |o| o.momentum_val_acc5, |o| o.batch_size)),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect();
        sink.log_dict(&metrics, LogOptions::SYNCED);
    }
}

impl<B: AutodiffBackend> TrainingPolicy<B> for MomentumMethod<B> {
    type Model = MomentumModel<B>;
    type TrainOutput = MomentumTrainingStepOutput<B>;
    type ValOutput = (ValidationStepOutput, Option<MomentumValOutput>);

    fn config(&self) -> &MethodConfig {
        self.base.config()
    }

    fn init_model(&self, device: &B::Device) -> Result<MomentumModel<B>, MethodError> {
        self.build_model(device)
    }

    fn learnable_params(&self, model: &MomentumModel<B>) -> Vec<ParamGroup> {
        self.param_groups(model)
    }

    fn on_train_start(&mut self) {
        self.latch.reset();
    }

    fn training_step(
        &mut self,
        model: &MomentumModel<B>,
        batch: &TrainBatch<B>,
        sink: &mut dyn MetricSink,
    ) -> Result<MomentumTrainingStepOutput<B>, MethodError> {
        self.train_step(model, batch, sink)
    }

    fn on_train_batch_end(
        &mut self,
        model: MomentumModel<B>,
        state: &TrainerState,
        sink: &mut dyn MetricSink,
    ) -> Result<MomentumModel<B>, MethodError> {
        self.after_batch(model, state, sink)
    }

    fn validation_step(
        &mut self,
        model: &<MomentumModel<B> as AutodiffModule<B>>::InnerModule,
        batch: &ValBatch<B::InnerBackend>,
        state: &TrainerState,
    ) -> Result<Self::ValOutput, MethodError> {
        Ok(self.val_step(model, batch, state))
    }

    fn validation_epoch_end(
        &mut self,
        outs: Vec<Self::ValOutput>,
        state: &TrainerState,
        sink: &mut dyn MetricSink,
    ) -> Result<(), MethodError> {
        self.val_epoch_end(outs, state, sink);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Crops;
    use crate::bridge::targets_to_tensor;
    use crate::logging::EpochMetricLogger;
    use backbones::BackboneArgs;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::module::{ModuleVisitor, ParamId};
    use burn::tensor::Distribution;

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;
    type Method = MomentumMethod<TestAutodiffBackend>;

    fn config(momentum_classifier: bool) -> MomentumMethodConfig {
        let method =
            MethodConfig::new("resnet18".into(), 4, 10).with_backbone_args(BackboneArgs::new().with_cifar(true));
        MomentumMethodConfig::new(method).with_momentum_classifier(momentum_classifier)
    }

    fn batch<B: Backend>(device: &B::Device) -> TrainBatch<B> {
        TrainBatch {
            indices: Tensor::arange(0..4, device),
            crops: Crops::Multi(
                (0..2).map(|_| Tensor::random([4, 3, 8, 8], Distribution::Normal(0.0, 1.0), device)).collect(),
            ),
            targets: targets_to_tensor(&[0, 1, 2, 3], device),
        }
    }

    struct Floats(Vec<Vec<f32>>);

    impl<B: Backend> ModuleVisitor<B> for Floats {
        fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
            self.0.push(tensor.to_data().iter::<f32>().collect());
        }
    }

    fn floats<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<f32>> {
        let mut visitor = Floats(Vec::new());
        module.visit(&mut visitor);
        visitor.0
    }

    #[test]
    fn test_momentum_backbone_starts_as_copy() {
        let method = Method::new(config(false)).unwrap();
        let model = method.build_model(&Default::default()).unwrap();
        assert_eq!(floats(&model.base.backbone), floats(&model.momentum_backbone));
        let momentum_ids = learnable_param_ids(&model.momentum_backbone);
        assert!(momentum_ids.is_empty(), "momentum backbone must not be trainable");
    }

    #[test]
    fn test_invalid_tau_rejected() {
        let err = Method::new(config(false).with_base_tau_momentum(1.0).with_final_tau_momentum(0.5));
        assert!(matches!(err, Err(MethodError::InvalidTau { .. })));
    }

    #[test]
    fn test_momentum_classifier_group() {
        let method = Method::new(config(true)).unwrap();
        let model = method.build_model(&Default::default()).unwrap();
        let groups = method.param_groups(&model);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[2].name, "momentum_classifier");
        assert_eq!(groups[2].lr, Some(method.base().config().classifier_lr));
        assert_eq!(groups[2].weight_decay, Some(0.0));

        let without = Method::new(config(false)).unwrap();
        let model = without.build_model(&Default::default()).unwrap();
        assert_eq!(without.param_groups(&model).len(), 2);
    }

    #[test]
    fn test_training_step_adds_momentum_loss() {
        let device = Default::default();
        let mut method = Method::new(config(true)).unwrap();
        let model = method.build_model(&device).unwrap();
        let mut sink = EpochMetricLogger::new();

        let out = method.train_step(&model, &batch(&device), &mut sink).unwrap();
        assert_eq!(out.momentum_feats.len(), 2);
        assert_eq!(out.momentum_logits.as_ref().map(Vec::len), Some(2));
        let class_loss = scalar_to_f64(out.base.loss.clone());
        let total = scalar_to_f64(out.loss());
        let momentum_loss = sink.get("train_momentum_class_loss").unwrap();
        assert!((total - class_loss - momentum_loss).abs() < 1e-4, "{total} != {class_loss} + {momentum_loss}");
        assert!(sink.get("train_momentum_acc1").is_some());
    }

    #[test]
    fn test_training_step_without_classifier_keeps_base_loss() {
        let device = Default::default();
        let mut method = Method::new(config(false)).unwrap();
        let model = method.build_model(&device).unwrap();
        let mut sink = EpochMetricLogger::new();

        let out = method.train_step(&model, &batch(&device), &mut sink).unwrap();
        assert!(out.momentum_logits.is_none());
        assert_eq!(scalar_to_f64(out.loss()), scalar_to_f64(out.base.loss));
        assert!(sink.get("train_momentum_class_loss").is_none());
    }

    #[test]
    fn test_batch_end_is_latched() {
        let device = Default::default();
        let mut method = Method::new(config(false)).unwrap();
        let model = method.build_model(&device).unwrap();
        let mut sink = EpochMetricLogger::new();
        method.on_train_start();

        let mut state = TrainerState::new(2, 5, 1);
        let model = method.after_batch(model, &state, &mut sink).unwrap();
        assert!(sink.get("tau").is_none(), "no optimizer step yet");
        assert_eq!(method.updater().cur_tau(), 0.99);

        state.global_step = 1;
        let model = method.after_batch(model, &state, &mut sink).unwrap();
        assert_eq!(sink.get("tau"), Some(0.99), "logged before advancing");
        let advanced = method.updater().cur_tau();
        assert!(advanced > 0.99);

        // same global step again: nothing changes
        let _model = method.after_batch(model, &state, &mut sink).unwrap();
        assert_eq!(method.updater().cur_tau(), advanced);
    }

    #[test]
    fn test_tau_step_uses_accumulation() {
        let device = Default::default();
        let mut method = Method::new(config(false)).unwrap();
        let model = method.build_model(&device).unwrap();
        let mut sink = EpochMetricLogger::new();
        let mut state = TrainerState::new(1, 8, 4);
        state.global_step = 1;
        method.after_batch(model, &state, &mut sink).unwrap();
        // cur_step = 1 * 4 of 8 * 1: midpoint of the schedule
        assert!((method.updater().cur_tau() - 0.995).abs() < 1e-12);
    }

    #[test]
    fn test_validation_aggregates_momentum_metrics() {
        let mut method = Method::new(config(true)).unwrap();
        let mut sink = EpochMetricLogger::new();
        let online = ValidationStepOutput { batch_size: 2, val_loss: 1.0, val_acc1: 50.0, val_acc5: 100.0 };
        let outs = vec![
            (
                online,
                Some(MomentumValOutput {
                    batch_size: 2,
                    momentum_val_loss: 2.0,
                    momentum_val_acc1: 10.0,
                    momentum_val_acc5: 60.0,
                }),
            ),
            (
                online,
                Some(MomentumValOutput {
                    batch_size: 6,
                    momentum_val_loss: 1.0,
                    momentum_val_acc1: 50.0,
                    momentum_val_acc5: 100.0,
                }),
            ),
        ];
        let state = TrainerState::new(1, 1, 1);
        method.val_epoch_end(outs, &state, &mut sink);
        assert_eq!(sink.get("val_loss"), Some(1.0));
        assert_eq!(sink.get("momentum_val_loss"), Some(1.25));
        assert_eq!(sink.get("momentum_val_acc1"), Some(40.0));
        assert_eq!(sink.get("momentum_val_acc5"), Some(90.0));
    }

    #[test]
    fn test_validation_step_on_inner_model() {
        let device = Default::default();
        let mut method = Method::new(config(true)).unwrap();
        let model = method.build_model(&device).unwrap().valid();
        let batch = ValBatch {
            images: Tensor::random([3, 3, 8, 8], Distribution::Normal(0.0, 1.0), &device),
            targets: targets_to_tensor(&[0, 1, 2], &device),
        };
        let (online, momentum) = method.val_step(&model, &batch, &TrainerState::new(1, 1, 1));
        assert_eq!(online.batch_size, 3);
        let momentum = momentum.expect("momentum classifier is enabled");
        assert_eq!(momentum.batch_size, 3);
        assert!(momentum.momentum_val_loss.is_finite());
    }
}
