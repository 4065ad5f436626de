//! Vision backbones for self-supervised pretraining.
//!
//! Every backbone maps `(batch, 3, H, W)` images to pooled `(batch, features_dim)`
//! features; none carries a classification layer. Architectures are looked up by
//! name in a closed [`registry::Architecture`] enum, and each family applies its
//! own construction rules (small-image stem, window override, feature width).

pub mod convnext;
pub mod init;
pub mod poolformer;
pub mod registry;
pub mod resnet;
pub mod swin;
pub mod transformer;
pub mod vit;

use burn::prelude::*;

pub use registry::{build_backbone, registry, Architecture, BackboneArgs, BackboneSpec, FeatureDimRule};

/// Errors raised while resolving or building a backbone.
#[derive(Debug, thiserror::Error)]
pub enum BackboneError {
    #[error("unknown backbone '{name}' (available: {available})")]
    UnknownArchitecture { name: String, available: String },
    #[error("invalid backbone argument: {0}")]
    InvalidArgument(String),
}

/// Uniform interface over all architectures.
pub trait FeatureExtractor<B: Backend> {
    /// Images `(batch, 3, H, W)` to pooled features `(batch, num_features)`.
    fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    fn num_features(&self) -> usize;
}

/// Any registered backbone.
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    ResNet(resnet::ResNet<B>),
    Vit(vit::VisionTransformer<B>),
    Swin(swin::SwinTransformer<B>),
    PoolFormer(poolformer::PoolFormer<B>),
    ConvNext(convnext::ConvNext<B>),
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_features(images)
    }
}

impl<B: Backend> FeatureExtractor<B> for Backbone<B> {
    fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Backbone::ResNet(model) => model.forward_features(images),
            Backbone::Vit(model) => model.forward_features(images),
            Backbone::Swin(model) => model.forward_features(images),
            Backbone::PoolFormer(model) => model.forward_features(images),
            Backbone::ConvNext(model) => model.forward_features(images),
        }
    }

    fn num_features(&self) -> usize {
        match self {
            Backbone::ResNet(model) => model.num_features(),
            Backbone::Vit(model) => model.num_features(),
            Backbone::Swin(model) => model.num_features(),
            Backbone::PoolFormer(model) => model.num_features(),
            Backbone::ConvNext(model) => model.num_features(),
        }
    }
}
