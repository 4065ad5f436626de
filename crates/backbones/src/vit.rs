//! Vision Transformer returning the normalized class token.

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::interpolate::{Interpolate2dConfig, InterpolateMode};
use burn::nn::{LayerNorm, LayerNormConfig};
use burn::prelude::*;

use crate::init::{Layer, ResetParameters, WeightInit, WeightInitializer};
use crate::transformer::TransformerBlock;
use crate::FeatureExtractor;

/// Configuration for a [`VisionTransformer`].
#[derive(Config, Debug)]
pub struct VitConfig {
    /// Token width.
    pub embed_dim: usize,
    /// Number of transformer blocks.
    pub depth: usize,
    pub num_heads: usize,
    #[config(default = 16)]
    pub patch_size: usize,
    /// Input resolution the positional embedding is laid out for.
    #[config(default = 224)]
    pub img_size: usize,
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
    #[config(default = 0)]
    pub seed: u64,
}

impl VitConfig {
    pub fn tiny() -> Self {
        Self::new(192, 12, 3)
    }

    pub fn small() -> Self {
        Self::new(384, 12, 6)
    }

    pub fn base() -> Self {
        Self::new(768, 12, 12)
    }

    pub fn large() -> Self {
        Self::new(1024, 24, 16)
    }

    pub fn num_features(&self) -> usize {
        self.embed_dim
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> VisionTransformer<B> {
        let grid = (self.img_size / self.patch_size).max(1);
        let dim = self.embed_dim;
        let mut model = VisionTransformer {
            patch_embed: Conv2dConfig::new([3, dim], [self.patch_size, self.patch_size])
                .with_stride([self.patch_size, self.patch_size])
                .init(device),
            cls_token: Param::from_tensor(Tensor::zeros([1, 1, dim], device)),
            pos_embed: Param::from_tensor(Tensor::zeros([1, grid * grid + 1, dim], device)),
            blocks: (0..self.depth)
                .map(|_| TransformerBlock::new(dim, self.num_heads, self.mlp_ratio, device))
                .collect(),
            norm: LayerNormConfig::new(dim).init(device),
            grid,
            embed_dim: dim,
        };
        WeightInitializer::new(self.seed).weights_init(&mut model);
        model
    }
}

#[derive(Module, Debug)]
pub struct VisionTransformer<B: Backend> {
    patch_embed: Conv2d<B>,
    cls_token: Param<Tensor<B, 3>>,
    pos_embed: Param<Tensor<B, 3>>,
    blocks: Vec<TransformerBlock<B>>,
    norm: LayerNorm<B>,
    /// Patch grid side the positional embedding was built for.
    grid: usize,
    embed_dim: usize,
}

impl<B: Backend> VisionTransformer<B> {
    /// Positional embedding for a `rows x cols` patch grid, resampled when the
    /// grid differs from the configured one.
    fn position_embedding(&self, rows: usize, cols: usize) -> Tensor<B, 3> {
        let pos = self.pos_embed.val();
        if rows == self.grid && cols == self.grid {
            return pos;
        }
        let dim = self.embed_dim;
        let cls = pos.clone().narrow(1, 0, 1);
        let patches = pos
            .narrow(1, 1, self.grid * self.grid)
            .reshape([1, self.grid, self.grid, dim])
            .permute([0, 3, 1, 2]);
        let resized = Interpolate2dConfig::new()
            .with_output_size(Some([rows, cols]))
            .with_mode(InterpolateMode::Linear)
            .init()
            .forward(patches)
            .permute([0, 2, 3, 1])
            .reshape([1, rows * cols, dim]);
        Tensor::cat(vec![cls, resized], 1)
    }
}

impl<B: Backend> FeatureExtractor<B> for VisionTransformer<B> {
    fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.patch_embed.forward(images);
        let [batch, dim, rows, cols] = x.dims();
        let tokens = x.reshape([batch, dim, rows * cols]).swap_dims(1, 2);
        let cls = Tensor::cat(vec![self.cls_token.val(); batch], 0);
        let x = Tensor::cat(vec![cls, tokens], 1) + self.position_embedding(rows, cols);
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));
        self.norm.forward(x).narrow(1, 0, 1).reshape([batch, dim])
    }

    fn num_features(&self) -> usize {
        self.embed_dim
    }
}

impl<B: Backend> ResetParameters<B> for VisionTransformer<B> {
    fn reset_parameters(&mut self, init: &mut WeightInitializer) {
        init.init_children(vec![
            &mut self.patch_embed as &mut dyn WeightInit<B>,
            &mut self.blocks,
            &mut self.norm,
        ]);
        init.truncated_normal(&mut self.pos_embed, 0.02);
        init.normal(&mut self.cls_token, 1e-6);
    }
}

impl<B: Backend> WeightInit<B> for VisionTransformer<B> {
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

    fn tiny_config() -> VitConfig {
        VitConfig::new(32, 2, 4).with_patch_size(4).with_img_size(16)
    }

    #[test]
    fn test_presets() {
        assert_eq!(VitConfig::tiny().num_features(), 192);
        assert_eq!(VitConfig::small().num_features(), 384);
        assert_eq!(VitConfig::base().num_features(), 768);
        assert_eq!(VitConfig::large().depth, 24);
    }

    #[test]
    fn test_forward_features() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::random([2, 3, 16, 16], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(model.forward_features(images).dims(), [2, 32]);
    }

    #[test]
    fn test_positional_embedding_resampled() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::random([1, 3, 8, 8], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(model.forward_features(images).dims(), [1, 32]);
    }

    #[test]
    fn test_token_init() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let max_cls: f32 = model.cls_token.val().abs().max().into_scalar().elem();
        assert!(max_cls < 1e-4, "cls token should start near zero, got {max_cls}");
        let max_pos: f32 = model.pos_embed.val().abs().max().into_scalar().elem();
        assert!(max_pos > 0.0 && max_pos <= 0.04 + 1e-6, "pos embed outside ±2σ: {max_pos}");
    }
}
