//! The hook surface a host training loop drives.
//!
//! A loop calls, in order: [`TrainingPolicy::init_model`],
//! [`TrainingPolicy::configure_optimizers`], [`TrainingPolicy::on_train_start`],
//! then per micro-batch [`TrainingPolicy::training_step`] and
//! [`TrainingPolicy::on_train_batch_end`], and per epoch
//! [`TrainingPolicy::validation_step`] over the validation set followed by
//! [`TrainingPolicy::validation_epoch_end`].

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;

use crate::batch::{StepLoss, TrainBatch, ValBatch};
use crate::config::MethodConfig;
use crate::error::MethodError;
use crate::logging::MetricSink;
use crate::optim::{configure_optimizers, ConfiguredOptimizer, ParamGroup};

/// Host-loop counters visible to the hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainerState {
    /// Optimizer steps taken so far.
    pub global_step: usize,
    pub current_epoch: usize,
    pub max_epochs: usize,
    /// Micro-batches per epoch.
    pub num_training_batches: usize,
    /// Micro-batches per optimizer step, at least 1.
    pub accumulate_grad_batches: usize,
    /// True while the pre-training validation pass runs.
    pub sanity_checking: bool,
}

impl TrainerState {
    pub fn new(max_epochs: usize, num_training_batches: usize, accumulate_grad_batches: usize) -> Self {
        Self {
            global_step: 0,
            current_epoch: 0,
            max_epochs,
            num_training_batches,
            accumulate_grad_batches: accumulate_grad_batches.max(1),
            sanity_checking: false,
        }
    }
}

pub trait TrainingPolicy<B: AutodiffBackend> {
    type Model: AutodiffModule<B> + 'static;
    type TrainOutput: StepLoss<B>;
    type ValOutput;

    /// Hyperparameters after accumulation scaling.
    fn config(&self) -> &MethodConfig;

    fn init_model(&self, device: &B::Device) -> Result<Self::Model, MethodError>;

    /// Parameter groups in optimizer order.
    fn learnable_params(&self, model: &Self::Model) -> Vec<ParamGroup>;

    fn configure_optimizers(&self, model: &Self::Model) -> Result<ConfiguredOptimizer<Self::Model, B>, MethodError> {
        configure_optimizers(self.config(), self.learnable_params(model))
    }

    fn on_train_start(&mut self) {}

    fn training_step(
        &mut self,
        model: &Self::Model,
        batch: &TrainBatch<B>,
        sink: &mut dyn MetricSink,
    ) -> Result<Self::TrainOutput, MethodError>;

    /// Runs after every micro-batch, including those inside an accumulation window.
    fn on_train_batch_end(
        &mut self,
        model: Self::Model,
        _state: &TrainerState,
        _sink: &mut dyn MetricSink,
    ) -> Result<Self::Model, MethodError> {
        Ok(model)
    }

    fn validation_step(
        &mut self,
        model: &<Self::Model as AutodiffModule<B>>::InnerModule,
        batch: &ValBatch<B::InnerBackend>,
        state: &TrainerState,
    ) -> Result<Self::ValOutput, MethodError>;

    fn validation_epoch_end(
        &mut self,
        outs: Vec<Self::ValOutput>,
        state: &TrainerState,
        sink: &mut dyn MetricSink,
    ) -> Result<(), MethodError>;
}

/// Source of training and validation batches.
///
/// Batches are built on demand as the loop pulls them, so only the batch in
/// flight is resident.
pub trait DataModule<B: AutodiffBackend> {
    fn train_batches(&self, epoch: usize) -> Box<dyn Iterator<Item = TrainBatch<B>> + '_>;

    fn val_batches(&self) -> Box<dyn Iterator<Item = ValBatch<B::InnerBackend>> + '_>;

    /// Number of items `train_batches` yields for any epoch.
    fn num_training_batches(&self) -> usize;
}
