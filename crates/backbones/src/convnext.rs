//! ConvNeXt: depthwise 7x7 conv, channels-last LayerNorm, inverted MLP.

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::gelu;

use crate::init::{Layer, ResetParameters, WeightInit, WeightInitializer};
use crate::FeatureExtractor;

#[derive(Config, Debug)]
pub struct ConvNextConfig {
    /// Blocks per stage.
    pub depths: Vec<usize>,
    /// Channel width per stage.
    pub dims: Vec<usize>,
    #[config(default = 1e-6)]
    pub layer_scale_init: f64,
    #[config(default = 0)]
    pub seed: u64,
}

impl ConvNextConfig {
    pub fn tiny() -> Self {
        Self::new(vec![3, 3, 9, 3], vec![96, 192, 384, 768])
    }

    pub fn small() -> Self {
        Self::new(vec![3, 3, 27, 3], vec![96, 192, 384, 768])
    }

    pub fn base() -> Self {
        Self::new(vec![3, 3, 27, 3], vec![128, 256, 512, 1024])
    }

    pub fn large() -> Self {
        Self::new(vec![3, 3, 27, 3], vec![192, 384, 768, 1536])
    }

    pub fn num_features(&self) -> usize {
        self.dims.last().copied().unwrap_or(0)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvNext<B> {
        let stages = self
            .depths
            .iter()
            .zip(&self.dims)
            .enumerate()
            .map(|(i, (&depth, &dim))| {
                let downsample = if i == 0 {
                    Downsample {
                        norm: LayerNormConfig::new(3).init(device),
                        conv: Conv2dConfig::new([3, dim], [4, 4]).with_stride([4, 4]).init(device),
                        norm_first: false,
                    }
                } else {
                    let prev = self.dims[i - 1];
                    Downsample {
                        norm: LayerNormConfig::new(prev).init(device),
                        conv: Conv2dConfig::new([prev, dim], [2, 2]).with_stride([2, 2]).init(device),
                        norm_first: true,
                    }
                };
                let blocks = (0..depth)
                    .map(|_| ConvNextBlock::new(dim, self.layer_scale_init, device))
                    .collect();
                ConvNextStage { downsample, blocks }
            })
            .collect();

        let mut model = ConvNext {
            stages,
            norm: LayerNormConfig::new(self.num_features()).init(device),
            num_features: self.num_features(),
        };
        WeightInitializer::new(self.seed).weights_init(&mut model);
        model
    }
}

#[derive(Module, Debug)]
pub struct ConvNext<B: Backend> {
    stages: Vec<ConvNextStage<B>>,
    /// Applied to the globally pooled features.
    norm: LayerNorm<B>,
    num_features: usize,
}

impl<B: Backend> FeatureExtractor<B> for ConvNext<B> {
    fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stages.iter().fold(images, |x, stage| stage.forward(x));
        let [batch, channels, rows, cols] = x.dims();
        let pooled = x.reshape([batch, channels, rows * cols]).mean_dim(2).reshape([batch, channels]);
        self.norm.forward(pooled)
    }

    fn num_features(&self) -> usize {
        self.num_features
    }
}

impl<B: Backend> WeightInit<B> for ConvNext<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(vec![&mut self.stages as &mut dyn WeightInit<B>, &mut self.norm])
    }
}

/// LayerNorm over the channel axis of a `(B, C, H, W)` map.
fn channels_first_norm<B: Backend>(norm: &LayerNorm<B>, x: Tensor<B, 4>) -> Tensor<B, 4> {
    norm.forward(x.permute([0, 2, 3, 1])).permute([0, 3, 1, 2])
}

/// Stem (conv then norm) or stage transition (norm then conv).
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    norm: LayerNorm<B>,
    conv: Conv2d<B>,
    norm_first: bool,
}

impl<B: Backend> Downsample<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.norm_first {
            self.conv.forward(channels_first_norm(&self.norm, x))
        } else {
            channels_first_norm(&self.norm, self.conv.forward(x))
        }
    }
}

impl<B: Backend> WeightInit<B> for Downsample<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(vec![&mut self.norm as &mut dyn WeightInit<B>, &mut self.conv])
    }
}

#[derive(Module, Debug)]
pub struct ConvNextStage<B: Backend> {
    downsample: Downsample<B>,
    blocks: Vec<ConvNextBlock<B>>,
}

impl<B: Backend> ConvNextStage<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.downsample.forward(x);
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }
}

impl<B: Backend> WeightInit<B> for ConvNextStage<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(vec![&mut self.downsample as &mut dyn WeightInit<B>, &mut self.blocks])
    }
}

#[derive(Module, Debug)]
pub struct ConvNextBlock<B: Backend> {
    dwconv: Conv2d<B>,
    norm: LayerNorm<B>,
    pwconv1: Linear<B>,
    pwconv2: Linear<B>,
    gamma: Param<Tensor<B, 1>>,
    layer_scale_init: f64,
}

impl<B: Backend> ConvNextBlock<B> {
    fn new(dim: usize, layer_scale_init: f64, device: &B::Device) -> Self {
        Self {
            dwconv: Conv2dConfig::new([dim, dim], [7, 7])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_groups(dim)
                .init(device),
            norm: LayerNormConfig::new(dim).init(device),
            pwconv1: LinearConfig::new(dim, 4 * dim).init(device),
            pwconv2: LinearConfig::new(4 * dim, dim).init(device),
            gamma: Param::from_tensor(Tensor::full([dim], layer_scale_init, device)),
            layer_scale_init,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, channels, _, _] = x.dims();
        let y = self.dwconv.forward(x.clone()).permute([0, 2, 3, 1]);
        let y = self.pwconv2.forward(gelu(self.pwconv1.forward(self.norm.forward(y))));
        let y = y * self.gamma.val().reshape([1, 1, 1, channels]);
        x + y.permute([0, 3, 1, 2])
    }
}

impl<B: Backend> ResetParameters<B> for ConvNextBlock<B> {
    fn reset_parameters(&mut self, init: &mut WeightInitializer) {
        init.init_children(vec![
            &mut self.dwconv as &mut dyn WeightInit<B>,
            &mut self.norm,
            &mut self.pwconv1,
            &mut self.pwconv2,
        ]);
        init.constant(&mut self.gamma, self.layer_scale_init);
    }
}

impl<B: Backend> WeightInit<B> for ConvNextBlock<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::CustomReset(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_presets() {
        assert_eq!(ConvNextConfig::tiny().num_features(), 768);
        assert_eq!(ConvNextConfig::large().num_features(), 1536);
    }

    #[test]
    fn test_forward_features() {
        let device = Default::default();
        let model = ConvNextConfig::new(vec![1, 1], vec![8, 16]).init::<TestBackend>(&device);
        let images = Tensor::random([2, 3, 16, 16], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(model.forward_features(images).dims(), [2, 16]);
    }

    #[test]
    fn test_block_starts_near_identity() {
        let device = Default::default();
        let block = ConvNextBlock::<TestBackend>::new(4, 1e-6, &device);
        let x = Tensor::random([1, 4, 5, 5], Distribution::Normal(0.0, 1.0), &device);
        let diff: f32 = (block.forward(x.clone()) - x).abs().max().into_scalar().elem();
        assert!(diff < 1e-3, "tiny layer scale should keep the block near identity, diff {diff}");
    }
}
