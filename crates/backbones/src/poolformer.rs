//! PoolFormer: MetaFormer blocks with average pooling as the token mixer.

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::gelu;

use crate::init::{Layer, ResetParameters, WeightInit, WeightInitializer};
use crate::FeatureExtractor;

#[derive(Config, Debug)]
pub struct PoolFormerConfig {
    /// Blocks per stage.
    pub layers: Vec<usize>,
    /// Channel width per stage.
    pub embed_dims: Vec<usize>,
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
    /// Initial value of the per-channel layer scale.
    #[config(default = 1e-5)]
    pub layer_scale_init: f64,
    #[config(default = 0)]
    pub seed: u64,
}

impl PoolFormerConfig {
    pub fn s12() -> Self {
        Self::new(vec![2, 2, 6, 2], vec![64, 128, 320, 512])
    }

    pub fn s24() -> Self {
        Self::new(vec![4, 4, 12, 4], vec![64, 128, 320, 512])
    }

    pub fn s36() -> Self {
        Self::new(vec![6, 6, 18, 6], vec![64, 128, 320, 512]).with_layer_scale_init(1e-6)
    }

    pub fn m36() -> Self {
        Self::new(vec![6, 6, 18, 6], vec![96, 192, 384, 768]).with_layer_scale_init(1e-6)
    }

    pub fn m48() -> Self {
        Self::new(vec![8, 8, 24, 8], vec![96, 192, 384, 768]).with_layer_scale_init(1e-6)
    }

    pub fn num_features(&self) -> usize {
        self.embed_dims.last().copied().unwrap_or(0)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> PoolFormer<B> {
        let first = self.embed_dims[0];
        let stages = self
            .layers
            .iter()
            .zip(&self.embed_dims)
            .enumerate()
            .map(|(i, (&depth, &dim))| {
                let downsample = self.embed_dims.get(i + 1).map(|&next| {
                    Conv2dConfig::new([dim, next], [3, 3])
                        .with_stride([2, 2])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device)
                });
                let blocks = (0..depth)
                    .map(|_| PoolFormerBlock::new(dim, self.mlp_ratio, self.layer_scale_init, device))
                    .collect();
                PoolFormerStage { blocks, downsample }
            })
            .collect();

        let mut model = PoolFormer {
            stem: Conv2dConfig::new([3, first], [7, 7])
                .with_stride([4, 4])
                .with_padding(PaddingConfig2d::Explicit(2, 2))
                .init(device),
            stages,
            norm: GroupNormConfig::new(1, self.num_features()).init(device),
            num_features: self.num_features(),
        };
        WeightInitializer::new(self.seed).weights_init(&mut model);
        model
    }
}

#[derive(Module, Debug)]
pub struct PoolFormer<B: Backend> {
    stem: Conv2d<B>,
    stages: Vec<PoolFormerStage<B>>,
    norm: GroupNorm<B>,
    num_features: usize,
}

impl<B: Backend> FeatureExtractor<B> for PoolFormer<B> {
    fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem.forward(images);
        let x = self.stages.iter().fold(x, |x, stage| stage.forward(x));
        let x = self.norm.forward(x);
        let [batch, channels, rows, cols] = x.dims();
        x.reshape([batch, channels, rows * cols]).mean_dim(2).reshape([batch, channels])
    }

    fn num_features(&self) -> usize {
        self.num_features
    }
}

impl<B: Backend> WeightInit<B> for PoolFormer<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(vec![
            &mut self.stem as &mut dyn WeightInit<B>,
            &mut self.stages,
            &mut self.norm,
        ])
    }
}

#[derive(Module, Debug)]
pub struct PoolFormerStage<B: Backend> {
    blocks: Vec<PoolFormerBlock<B>>,
    downsample: Option<Conv2d<B>>,
}

impl<B: Backend> PoolFormerStage<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));
        match &self.downsample {
            Some(conv) => conv.forward(x),
            None => x,
        }
    }
}

impl<B: Backend> WeightInit<B> for PoolFormerStage<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(vec![&mut self.blocks as &mut dyn WeightInit<B>, &mut self.downsample])
    }
}

/// `x + s1 * (pool(norm(x)) - norm(x))`, then `x + s2 * mlp(norm(x))`.
#[derive(Module, Debug)]
pub struct PoolFormerBlock<B: Backend> {
    norm1: GroupNorm<B>,
    pool: AvgPool2d,
    norm2: GroupNorm<B>,
    fc1: Conv2d<B>,
    fc2: Conv2d<B>,
    layer_scale_1: Param<Tensor<B, 1>>,
    layer_scale_2: Param<Tensor<B, 1>>,
    layer_scale_init: f64,
}

impl<B: Backend> PoolFormerBlock<B> {
    fn new(dim: usize, mlp_ratio: f64, layer_scale_init: f64, device: &B::Device) -> Self {
        let hidden = (dim as f64 * mlp_ratio) as usize;
        Self {
            norm1: GroupNormConfig::new(1, dim).init(device),
            pool: AvgPool2dConfig::new([3, 3])
                .with_strides([1, 1])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_count_include_pad(false)
                .init(),
            norm2: GroupNormConfig::new(1, dim).init(device),
            fc1: Conv2dConfig::new([dim, hidden], [1, 1]).init(device),
            fc2: Conv2dConfig::new([hidden, dim], [1, 1]).init(device),
            layer_scale_1: Param::from_tensor(Tensor::full([dim], layer_scale_init, device)),
            layer_scale_2: Param::from_tensor(Tensor::full([dim], layer_scale_init, device)),
            layer_scale_init,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, channels, _, _] = x.dims();
        let scale_1 = self.layer_scale_1.val().reshape([1, channels, 1, 1]);
        let scale_2 = self.layer_scale_2.val().reshape([1, channels, 1, 1]);

        let normed = self.norm1.forward(x.clone());
        let mixed = self.pool.forward(normed.clone()) - normed;
        let x = x + mixed * scale_1;

        let hidden = gelu(self.fc1.forward(self.norm2.forward(x.clone())));
        x.clone() + self.fc2.forward(hidden) * scale_2
    }
}

impl<B: Backend> ResetParameters<B> for PoolFormerBlock<B> {
    fn reset_parameters(&mut self, init: &mut WeightInitializer) {
        init.init_children(vec![
            &mut self.norm1 as &mut dyn WeightInit<B>,
            &mut self.norm2,
            &mut self.fc1,
            &mut self.fc2,
        ]);
        init.constant(&mut self.layer_scale_1, self.layer_scale_init);
        init.constant(&mut self.layer_scale_2, self.layer_scale_init);
    }
}

impl<B: Backend> WeightInit<B> for PoolFormerBlock<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::CustomReset(self)
    }
}
