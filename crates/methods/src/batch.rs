//! Batch layouts and per-step outputs.

use burn::prelude::*;

/// Image crops of one batch: either a single view or one tensor per crop,
/// large crops first.
#[derive(Debug, Clone)]
pub enum Crops<B: Backend> {
    Single(Tensor<B, 4>),
    Multi(Vec<Tensor<B, 4>>),
}

impl<B: Backend> Crops<B> {
    /// Normalize to a list; a single tensor becomes a one-element list.
    pub fn to_vec(&self) -> Vec<Tensor<B, 4>> {
        match self {
            Crops::Single(x) => vec![x.clone()],
            Crops::Multi(xs) => xs.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Crops::Single(_) => 1,
            Crops::Multi(xs) => xs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `(sample_indices, crops, targets)`; targets may hold `-1` for unlabeled samples.
#[derive(Debug, Clone)]
pub struct TrainBatch<B: Backend> {
    pub indices: Tensor<B, 1, Int>,
    pub crops: Crops<B>,
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Debug, Clone)]
pub struct ValBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ValBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.targets.dims()[0]
    }
}

/// Features and online-classifier logits of one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput<B: Backend> {
    pub logits: Tensor<B, 2>,
    pub feats: Tensor<B, 2>,
}

/// Forward pass plus classification statistics for one crop.
#[derive(Debug, Clone)]
pub struct SharedStepOutput<B: Backend> {
    pub logits: Tensor<B, 2>,
    pub feats: Tensor<B, 2>,
    pub loss: Tensor<B, 1>,
    pub acc1: f64,
    pub acc5: f64,
}

/// Output of [`crate::BaseMethod::training_step`].
///
/// `feats` holds one tensor per crop: large crops first, then small crops in
/// multi-crop mode. `logits` covers the large crops only.
#[derive(Debug, Clone)]
pub struct TrainingStepOutput<B: Backend> {
    pub logits: Vec<Tensor<B, 2>>,
    pub feats: Vec<Tensor<B, 2>>,
    /// Mean classification loss over large crops; methods add their own terms.
    pub loss: Tensor<B, 1>,
    pub acc1: f64,
    pub acc5: f64,
}

/// Anything a training step returns that carries the loss to optimize.
pub trait StepLoss<B: Backend> {
    fn loss(&self) -> Tensor<B, 1>;
}

impl<B: Backend> StepLoss<B> for TrainingStepOutput<B> {
    fn loss(&self) -> Tensor<B, 1> {
        self.loss.clone()
    }
}

/// Host-side validation statistics of one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationStepOutput {
    pub batch_size: usize,
    pub val_loss: f64,
    pub val_acc1: f64,
    pub val_acc5: f64,
}
