//! Backbone plus online linear classifier, shared by every method.
//!
//! The classifier is trained on detached features: it measures how linearly
//! separable the representation is without feeding gradients back into it.

use backbones::{build_backbone, Architecture, Backbone};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::batch::{ForwardOutput, SharedStepOutput, TrainBatch, TrainingStepOutput, ValBatch, ValidationStepOutput};
use crate::bridge::scalar_to_f64;
use crate::config::MethodConfig;
use crate::error::MethodError;
use crate::eval::{accuracy_at_k, weighted_mean, DistanceFn, WeightedKnnClassifier};
use crate::logging::{LogOptions, MetricSink};
use crate::loss::cross_entropy_with_ignore;
use crate::optim::{learnable_param_ids, ParamGroup};
use crate::policy::{TrainerState, TrainingPolicy};

/// Top-k values reported for every classifier; clamped to the class count.
pub const TOP_K: [usize; 2] = [1, 5];

#[derive(Module, Debug)]
pub struct BaseModel<B: Backend> {
    pub backbone: Backbone<B>,
    pub classifier: Linear<B>,
}

impl<B: Backend> BaseModel<B> {
    /// Features and classifier logits for one crop.
    pub fn base_forward(&self, images: Tensor<B, 4>) -> ForwardOutput<B> {
        let feats = self.backbone.forward(images);
        let logits = self.classifier.forward(feats.clone().detach());
        ForwardOutput { logits, feats }
    }
}

/// Forward one crop and score the online classifier on it.
pub fn shared_step<B: Backend>(
    model: &BaseModel<B>,
    images: Tensor<B, 4>,
    targets: Tensor<B, 1, Int>,
) -> SharedStepOutput<B> {
    let ForwardOutput { logits, feats } = model.base_forward(images);
    let loss = cross_entropy_with_ignore(logits.clone(), targets.clone());
    let acc = accuracy_at_k(logits.clone().detach(), targets, &TOP_K);
    SharedStepOutput { logits, feats, loss, acc1: acc[0], acc5: acc[1] }
}

/// Shared method state for training backend `B`.
///
/// The k-NN banks hold detached features on `B::InnerBackend`, the backend
/// validation runs on.
#[derive(Debug)]
pub struct BaseMethod<B: AutodiffBackend> {
    config: MethodConfig,
    architecture: Architecture,
    features_dim: usize,
    num_crops: usize,
    multicrop: bool,
    knn: Option<WeightedKnnClassifier<B::InnerBackend>>,
}

impl<B: AutodiffBackend> BaseMethod<B> {
    /// Resolve the backbone and derive crop counts; learning rates are scaled
    /// by the accumulation factor here, once.
    pub fn new(config: MethodConfig) -> Result<Self, MethodError> {
        let architecture: Architecture = config.backbone.parse()?;
        if config.num_large_crops == 0 {
            return Err(MethodError::InvalidConfig("num_large_crops must be at least 1".into()));
        }
        if config.num_classes == 0 {
            return Err(MethodError::InvalidConfig("num_classes must be at least 1".into()));
        }
        let features_dim = architecture.family(&config.backbone_args, config.out_size).features_dim();
        let config = config.scaled_for_accumulation();
        let num_crops = config.num_crops();
        let multicrop = config.num_small_crops > 0;
        let knn = config.knn_eval.then(|| WeightedKnnClassifier::new(config.knn_k, DistanceFn::Euclidean));

        tracing::info!(
            backbone = %architecture,
            features_dim,
            num_crops,
            multicrop,
            knn = config.knn_eval,
            "Initialized method"
        );

        Ok(Self { config, architecture, features_dim, num_crops, multicrop, knn })
    }

    pub fn config(&self) -> &MethodConfig {
        &self.config
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn features_dim(&self) -> usize {
        self.features_dim
    }

    pub fn num_crops(&self) -> usize {
        self.num_crops
    }

    pub fn multicrop(&self) -> bool {
        self.multicrop
    }

    pub fn knn(&self) -> Option<&WeightedKnnClassifier<B::InnerBackend>> {
        self.knn.as_ref()
    }

    pub fn build_backbone(&self, device: &B::Device) -> Result<Backbone<B>, MethodError> {
        let (backbone, _) =
            build_backbone(self.architecture, &self.config.backbone_args, self.config.out_size, device)?;
        Ok(backbone)
    }

    pub fn build_model(&self, device: &B::Device) -> Result<BaseModel<B>, MethodError> {
        let backbone = self.build_backbone(device)?;
        let classifier = LinearConfig::new(self.features_dim, self.config.num_classes).init(device);
        Ok(BaseModel { backbone, classifier })
    }

    /// `[backbone, classifier]`; the classifier uses `classifier_lr` and no weight decay.
    pub fn param_groups(&self, model: &BaseModel<B>) -> Vec<ParamGroup> {
        vec![
            ParamGroup::new("backbone", learnable_param_ids(&model.backbone)),
            ParamGroup::new("classifier", learnable_param_ids(&model.classifier))
                .with_lr(self.config.classifier_lr)
                .with_weight_decay(0.0),
        ]
    }

    /// Online step over every crop of `batch`.
    ///
    /// Loss and accuracies are averaged over the large crops. Small crops only
    /// contribute features.
    pub fn train_step(
        &mut self,
        model: &BaseModel<B>,
        batch: &TrainBatch<B>,
        sink: &mut dyn MetricSink,
    ) -> Result<TrainingStepOutput<B>, MethodError> {
        let crops = batch.crops.to_vec();
        if crops.len() != self.num_crops {
            return Err(MethodError::CropCountMismatch { expected: self.num_crops, got: crops.len() });
        }
        let (large, small) = crops.split_at(self.config.num_large_crops);

        let outs: Vec<SharedStepOutput<B>> =
            large.iter().map(|x| shared_step(model, x.clone(), batch.targets.clone())).collect();
        let n = outs.len() as f64;
        let loss = Tensor::cat(outs.iter().map(|o| o.loss.clone()).collect(), 0).mean();
        let acc1 = outs.iter().map(|o| o.acc1).sum::<f64>() / n;
        let acc5 = outs.iter().map(|o| o.acc5).sum::<f64>() / n;

        let logits: Vec<_> = outs.iter().map(|o| o.logits.clone()).collect();
        let mut feats: Vec<_> = outs.into_iter().map(|o| o.feats).collect();
        if self.multicrop {
            feats.extend(small.iter().map(|x| model.backbone.forward(x.clone())));
        }

        sink.log_dict(
            &[("train_class_loss", scalar_to_f64(loss.clone())), ("train_acc1", acc1), ("train_acc5", acc5)],
            LogOptions::EPOCH_SYNCED,
        );

        if let Some(knn) = self.knn.as_mut() {
            let targets = batch.targets.clone().inner();
            for large_feats in &feats[..self.config.num_large_crops] {
                knn.add_train(large_feats.clone().detach().inner(), targets.clone());
            }
        }

        Ok(TrainingStepOutput { logits, feats, loss, acc1, acc5 })
    }

    pub fn val_step(
        &mut self,
        model: &BaseModel<B::InnerBackend>,
        batch: &ValBatch<B::InnerBackend>,
        state: &TrainerState,
    ) -> ValidationStepOutput {
        let out = shared_step(model, batch.images.clone(), batch.targets.clone());
        if !state.sanity_checking {
            if let Some(knn) = self.knn.as_mut() {
                knn.add_test(out.feats, batch.targets.clone());
            }
        }
        ValidationStepOutput {
            batch_size: batch.batch_size(),
            val_loss: scalar_to_f64(out.loss),
            val_acc1: out.acc1,
            val_acc5: out.acc5,
        }
    }

    /// Batch-size weighted validation means, plus k-NN accuracy outside the
    /// sanity check.
    pub fn val_epoch_end(&mut self, outs: &[ValidationStepOutput], state: &TrainerState, sink: &mut dyn MetricSink) {
        let mut metrics: Vec<(&str, f64)> = [
            ("val_loss", weighted_mean(outs, |o| o.val_loss, |o| o.batch_size)),
            ("val_acc1", weighted_mean(outs, |o| o.val_acc1, |o| o.batch_size)),
            ("val_acc5", weighted_mean(outs, |o| o.val_acc5, |o| o.batch_size)),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect();

        if !state.sanity_checking {
            if let Some(knn) = self.knn.as_mut() {
                let (top1, top5) = knn.compute();
                metrics.push(("val_knn_acc1", top1));
                metrics.push(("val_knn_acc5", top5));
            }
        }
        sink.log_dict(&metrics, LogOptions::SYNCED);
    }
}

impl<B: AutodiffBackend> TrainingPolicy<B> for BaseMethod<B> {
    type Model = BaseModel<B>;
    type TrainOutput = TrainingStepOutput<B>;
    type ValOutput = ValidationStepOutput;

    fn config(&self) -> &MethodConfig {
        &self.config
    }

    fn init_model(&self, device: &B::Device) -> Result<BaseModel<B>, MethodError> {
        self.build_model(device)
    }

    fn learnable_params(&self, model: &BaseModel<B>) -> Vec<ParamGroup> {
        self.param_groups(model)
    }

    fn training_step(
        &mut self,
        model: &BaseModel<B>,
        batch: &TrainBatch<B>,
        sink: &mut dyn MetricSink,
    ) -> Result<TrainingStepOutput<B>, MethodError> {
        self.train_step(model, batch, sink)
    }

    fn validation_step(
        &mut self,
        model: &BaseModel<B::InnerBackend>,
        batch: &ValBatch<B::InnerBackend>,
        state: &TrainerState,
    ) -> Result<ValidationStepOutput, MethodError> {
        Ok(self.val_step(model, batch, state))
    }

    fn validation_epoch_end(
        &mut self,
        outs: Vec<ValidationStepOutput>,
        state: &TrainerState,
        sink: &mut dyn MetricSink,
    ) -> Result<(), MethodError> {
        self.val_epoch_end(&outs, state, sink);
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
    use burn::module::AutodiffModule;
    use burn::optim::GradientsParams;
    use burn::tensor::Distribution;

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;
    type Method = BaseMethod<TestAutodiffBackend>;

    fn config() -> MethodConfig {
        MethodConfig::new("resnet18".into(), 4, 10).with_backbone_args(BackboneArgs::new().with_cifar(true))
    }

    fn images<B: Backend>(batch: usize, device: &B::Device) -> Tensor<B, 4> {
        Tensor::random([batch, 3, 8, 8], Distribution::Normal(0.0, 1.0), device)
    }

    fn batch<B: Backend>(crops: usize, targets: &[i64], device: &B::Device) -> TrainBatch<B> {
        let n = targets.len();
        TrainBatch {
            indices: Tensor::arange(0..n as i64, device),
            crops: Crops::Multi((0..crops).map(|_| images(n, device)).collect()),
            targets: targets_to_tensor(targets, device),
        }
    }

    fn state() -> TrainerState {
        TrainerState::new(10, 5, 1)
    }

    #[test]
    fn test_unknown_backbone_is_fatal() {
        let err = Method::new(MethodConfig { backbone: "resnet9000".into(), ..config() }).unwrap_err();
        assert!(matches!(err, MethodError::Backbone(_)), "got {err}");
        assert!(err.to_string().contains("resnet18"), "error should list available names: {err}");
    }

    #[test]
    fn test_zero_large_crops_rejected() {
        let err = Method::new(config().with_num_large_crops(0)).unwrap_err();
        assert!(matches!(err, MethodError::InvalidConfig(_)));
    }

    #[test]
    fn test_derived_counts() {
        let method = Method::new(config().with_num_small_crops(4)).unwrap();
        assert_eq!(method.num_crops(), 6);
        assert!(method.multicrop());
        assert_eq!(method.features_dim(), 512);
    }

    #[test]
    fn test_lr_scaling_happens_once() {
        let method = Method::new(config().with_lr(0.1).with_accumulate_grad_batches(Some(2))).unwrap();
        assert!((method.config().lr - 0.2).abs() < 1e-12, "lr {}", method.config().lr);
    }

    #[test]
    fn test_param_groups() {
        let method = Method::new(config().with_classifier_lr(0.7)).unwrap();
        let model = method.build_model(&Default::default()).unwrap();
        let groups = method.param_groups(&model);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "backbone");
        assert_eq!(groups[0].lr, None);
        assert!(!groups[0].params.is_empty());
        assert_eq!(groups[1].lr, Some(0.7));
        assert_eq!(groups[1].weight_decay, Some(0.0));
        assert_eq!(groups[1].params.len(), 2, "linear weight + bias");
    }

    #[test]
    fn test_classifier_does_not_backprop_into_backbone() {
        let device = Default::default();
        let method = Method::new(config()).unwrap();
        let model = method.build_model(&device).unwrap();
        let targets = targets_to_tensor(&[0, 1, 2, 3], &device);
        let out = shared_step(&model, images(4, &device), targets);
        let grads = out.loss.backward();
        let weight = model.classifier.weight.val();
        assert!(weight.grad(&grads).is_some(), "classifier must receive gradients");
        let backbone_grads = GradientsParams::from_grads(grads, &model.backbone);
        assert!(backbone_grads.is_empty(), "classifier loss must not reach the backbone");
    }

    #[test]
    fn test_crop_count_mismatch() {
        let device = Default::default();
        let mut method = Method::new(config()).unwrap();
        let model = method.build_model(&device).unwrap();
        let mut sink = EpochMetricLogger::new();

        let single = TrainBatch {
            indices: Tensor::arange(0..2, &device),
            crops: Crops::Single(images(2, &device)),
            targets: targets_to_tensor(&[0, 1], &device),
        };
        let err = method.train_step(&model, &single, &mut sink).unwrap_err();
        assert!(matches!(err, MethodError::CropCountMismatch { expected: 2, got: 1 }), "got {err}");
    }

    #[test]
    fn test_single_tensor_is_one_crop() {
        let device = Default::default();
        let mut method = Method::new(config().with_num_large_crops(1)).unwrap();
        let model = method.build_model(&device).unwrap();
        let mut sink = EpochMetricLogger::new();
        let single = TrainBatch {
            indices: Tensor::arange(0..2, &device),
            crops: Crops::Single(images(2, &device)),
            targets: targets_to_tensor(&[0, 1], &device),
        };
        let out = method.train_step(&model, &single, &mut sink).unwrap();
        assert_eq!(out.feats.len(), 1);
        assert_eq!(out.logits[0].dims(), [2, 4]);
    }

    #[test]
    fn test_training_step_logs_and_appends_small_crops() {
        let device = Default::default();
        let mut method = Method::new(config().with_num_small_crops(2)).unwrap();
        let model = method.build_model(&device).unwrap();
        let mut sink = EpochMetricLogger::new();

        let out = method.train_step(&model, &batch(4, &[0, 1, 2, 3], &device), &mut sink).unwrap();
        assert_eq!(out.feats.len(), 4, "2 large + 2 small");
        assert_eq!(out.logits.len(), 2, "logits only for large crops");
        assert_eq!(out.feats[3].dims(), [4, 512]);
        for name in ["train_class_loss", "train_acc1", "train_acc5"] {
            assert!(sink.get(name).is_some(), "missing {name}");
            assert!(sink.requires_sync(name));
        }
        let loss = scalar_to_f64(out.loss);
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn test_loss_is_mean_over_large_crops() {
        let device = Default::default();
        let mut method = Method::new(config()).unwrap();
        let model = method.build_model(&device).unwrap();
        let mut sink = EpochMetricLogger::new();
        let batch = batch(2, &[0, 1, 2, 3], &device);

        let out = method.train_step(&model, &batch, &mut sink).unwrap();
        let crops = batch.crops.to_vec();
        let expected = crops
            .iter()
            .map(|x| scalar_to_f64(shared_step(&model, x.clone(), batch.targets.clone()).loss))
            .sum::<f64>()
            / 2.0;
        let got = scalar_to_f64(out.loss);
        assert!((got - expected).abs() < 1e-5, "expected {expected}, got {got}");
    }

    #[test]
    fn test_knn_banks_and_sanity_check() {
        let device = Default::default();
        let mut method = Method::new(config().with_knn_eval(true).with_knn_k(3)).unwrap();
        let model = method.build_model(&device).unwrap();
        let mut sink = EpochMetricLogger::new();

        method.train_step(&model, &batch(2, &[0, -1, 2, -1], &device), &mut sink).unwrap();
        // every row of both large crops; unlabeled rows are banked but never vote
        assert_eq!(method.knn().unwrap().num_train(), 8);

        let inner = model.valid();
        let val = ValBatch { images: images(3, &device), targets: targets_to_tensor(&[0, 1, 2], &device) };
        let mut sanity = state();
        sanity.sanity_checking = true;
        method.val_step(&inner, &val, &sanity);
        assert_eq!(method.knn().unwrap().num_test(), 0, "sanity check must not feed k-NN");

        let out = method.val_step(&inner, &val, &state());
        assert_eq!(out.batch_size, 3);
        assert_eq!(method.knn().unwrap().num_test(), 3);

        method.val_epoch_end(&[out], &state(), &mut sink);
        let top1 = sink.get("val_knn_acc1").unwrap();
        assert!((0.0..=100.0).contains(&top1));
        assert!(sink.get("val_knn_acc5").is_some());
        assert_eq!(method.knn().unwrap().num_train(), 0, "compute resets the banks");
    }

    #[test]
    fn test_identical_large_crops_match_single_crop() {
        let device = Default::default();
        let mut doubled = Method::new(config()).unwrap();
        let mut single = Method::new(config().with_num_large_crops(1)).unwrap();
        let model = doubled.build_model(&device).unwrap();
        let mut sink = EpochMetricLogger::new();

        let x = images(4, &device);
        let targets = targets_to_tensor(&[0, 1, 2, -1], &device);
        let two_crops = TrainBatch {
            indices: Tensor::arange(0..4, &device),
            crops: Crops::Multi(vec![x.clone(), x.clone()]),
            targets: targets.clone(),
        };
        let one_crop = TrainBatch { indices: Tensor::arange(0..4, &device), crops: Crops::Single(x), targets };

        let a = doubled.train_step(&model, &two_crops, &mut sink).unwrap();
        let b = single.train_step(&model, &one_crop, &mut sink).unwrap();
        let (loss_a, loss_b) = (scalar_to_f64(a.loss), scalar_to_f64(b.loss));
        assert!((loss_a - loss_b).abs() < 1e-6, "{loss_a} vs {loss_b}");
        assert_eq!(a.acc1, b.acc1);
        assert_eq!(a.acc5, b.acc5);
    }

    #[test]
    fn test_validation_means_are_batch_weighted() {
        let mut method = Method::new(config()).unwrap();
        let mut sink = EpochMetricLogger::new();
        let outs = [
            ValidationStepOutput { batch_size: 3, val_loss: 1.0, val_acc1: 30.0, val_acc5: 90.0 },
            ValidationStepOutput { batch_size: 1, val_loss: 5.0, val_acc1: 70.0, val_acc5: 100.0 },
        ];
        method.val_epoch_end(&outs, &state(), &mut sink);
        assert_eq!(sink.get("val_loss"), Some(2.0));
        assert_eq!(sink.get("val_acc1"), Some(40.0));
        assert_eq!(sink.get("val_acc5"), Some(92.5));
        assert!(sink.get("val_knn_acc1").is_none(), "k-NN disabled");
        assert!(sink.requires_sync("val_loss"));
    }

    #[test]
    fn test_empty_validation_logs_nothing() {
        let mut method = Method::new(config()).unwrap();
        let mut sink = EpochMetricLogger::new();
        method.val_epoch_end(&[], &state(), &mut sink);
        assert!(sink.get("val_loss").is_none());
    }

    #[test]
    fn test_top_k_clamped_to_classes() {
        let device = Default::default();
        let method = Method::new(MethodConfig { num_classes: 3, ..config() }).unwrap();
        let model = method.build_model(&device).unwrap();
        let out = shared_step(&model, images(4, &device), targets_to_tensor(&[0, 1, 2, 0], &device));
        // top-5 over 3 classes always contains the target
        assert_eq!(out.acc5, 100.0);
    }
}
