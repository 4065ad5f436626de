//! Swin Transformer: windowed attention with shifted windows and patch merging.
//!
//! Activations flow channels-last, `(batch, H, W, C)`. Windows are clamped to
//! the feature map, and shifting is disabled once a single window covers it.

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::TensorData;

use crate::init::{Layer, ResetParameters, WeightInit, WeightInitializer};
use crate::transformer::{Attention, Mlp};
use crate::FeatureExtractor;

/// Score added between tokens from different regions of a shifted window.
const SHIFT_MASK_VALUE: f32 = -100.0;

/// Configuration for a [`SwinTransformer`].
#[derive(Config, Debug)]
pub struct SwinConfig {
    pub embed_dim: usize,
    /// Blocks per stage.
    pub depths: Vec<usize>,
    /// Attention heads per stage.
    pub num_heads: Vec<usize>,
    #[config(default = 7)]
    pub window_size: usize,
    #[config(default = 4)]
    pub patch_size: usize,
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
    #[config(default = 0)]
    pub seed: u64,
}

impl SwinConfig {
    pub fn tiny() -> Self {
        Self::new(96, vec![2, 2, 6, 2], vec![3, 6, 12, 24])
    }

    pub fn small() -> Self {
        Self::new(96, vec![2, 2, 18, 2], vec![3, 6, 12, 24])
    }

    pub fn base() -> Self {
        Self::new(128, vec![2, 2, 18, 2], vec![4, 8, 16, 32])
    }

    pub fn large() -> Self {
        Self::new(192, vec![2, 2, 18, 2], vec![6, 12, 24, 48])
    }

    /// Channel width after the last stage; each merge doubles it.
    pub fn num_features(&self) -> usize {
        self.embed_dim << self.depths.len().saturating_sub(1)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> SwinTransformer<B> {
        let num_stages = self.depths.len();
        let mut dim = self.embed_dim;
        let mut stages = Vec::with_capacity(num_stages);
        for (i, (&depth, &heads)) in self.depths.iter().zip(&self.num_heads).enumerate() {
            let blocks = (0..depth)
                .map(|j| SwinBlock::new(dim, heads, self.window_size, j % 2 == 1, self.mlp_ratio, device))
                .collect();
            let downsample = (i + 1 < num_stages).then(|| PatchMerging::new(dim, device));
            stages.push(SwinStage { blocks, downsample });
            if i + 1 < num_stages {
                dim *= 2;
            }
        }

        let mut model = SwinTransformer {
            patch_embed: Conv2dConfig::new([3, self.embed_dim], [self.patch_size, self.patch_size])
                .with_stride([self.patch_size, self.patch_size])
                .init(device),
            patch_norm: LayerNormConfig::new(self.embed_dim).init(device),
            stages,
            norm: LayerNormConfig::new(dim).init(device),
            num_features: dim,
        };
        WeightInitializer::new(self.seed).weights_init(&mut model);
        model
    }
}

#[derive(Module, Debug)]
pub struct SwinTransformer<B: Backend> {
    patch_embed: Conv2d<B>,
    patch_norm: LayerNorm<B>,
    stages: Vec<SwinStage<B>>,
    norm: LayerNorm<B>,
    num_features: usize,
}

impl<B: Backend> SwinTransformer<B> {
    /// Configured window side of the first block.
    pub fn window_size(&self) -> usize {
        self.stages
            .first()
            .and_then(|stage| stage.blocks.first())
            .map(|block| block.window_size)
            .unwrap_or(0)
    }
}

impl<B: Backend> FeatureExtractor<B> for SwinTransformer<B> {
    fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.patch_embed.forward(images).permute([0, 2, 3, 1]);
        let x = self.patch_norm.forward(x);
        let x = self.stages.iter().fold(x, |x, stage| stage.forward(x));
        let x = self.norm.forward(x);
        let [batch, rows, cols, channels] = x.dims();
        x.reshape([batch, rows * cols, channels]).mean_dim(1).reshape([batch, channels])
    }

    fn num_features(&self) -> usize {
        self.num_features
    }
}

impl<B: Backend> WeightInit<B> for SwinTransformer<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(vec![
            &mut self.patch_embed as &mut dyn WeightInit<B>,
            &mut self.patch_norm,
            &mut self.stages,
            &mut self.norm,
        ])
    }
}

#[derive(Module, Debug)]
pub struct SwinStage<B: Backend> {
    blocks: Vec<SwinBlock<B>>,
    downsample: Option<PatchMerging<B>>,
}

impl<B: Backend> SwinStage<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));
        match &self.downsample {
            Some(merge) => merge.forward(x),
            None => x,
        }
    }
}

impl<B: Backend> WeightInit<B> for SwinStage<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(vec![&mut self.blocks as &mut dyn WeightInit<B>, &mut self.downsample])
    }
}

/// Window attention block; odd blocks in a stage use shifted windows.
#[derive(Module, Debug)]
pub struct SwinBlock<B: Backend> {
    norm1: LayerNorm<B>,
    attn: Attention<B>,
    /// `((2 * window - 1)^2, heads)` learnable relative position bias.
    relative_bias: Param<Tensor<B, 2>>,
    norm2: LayerNorm<B>,
    mlp: Mlp<B>,
    window_size: usize,
    shifted: bool,
}

impl<B: Backend> SwinBlock<B> {
    fn new(
        dim: usize,
        heads: usize,
        window_size: usize,
        shifted: bool,
        mlp_ratio: f64,
        device: &B::Device,
    ) -> Self {
        let table = (2 * window_size - 1) * (2 * window_size - 1);
        Self {
            norm1: LayerNormConfig::new(dim).init(device),
            attn: Attention::new(dim, heads, device),
            relative_bias: Param::from_tensor(Tensor::zeros([table, heads], device)),
            norm2: LayerNormConfig::new(dim).init(device),
            mlp: Mlp::new(dim, (dim as f64 * mlp_ratio) as usize, device),
            window_size,
            shifted,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, rows, cols, channels] = x.dims();
        let device = x.device();
        let (window, shift) = if rows.min(cols) <= self.window_size {
            (rows.min(cols), 0)
        } else {
            (self.window_size, if self.shifted { self.window_size / 2 } else { 0 })
        };
        let padded_rows = rows.div_ceil(window) * window;
        let padded_cols = cols.div_ceil(window) * window;

        let shortcut = x.clone();
        let x = pad_to(self.norm1.forward(x), padded_rows, padded_cols);
        let x = if shift > 0 {
            roll(roll(x, -(shift as isize), 1), -(shift as isize), 2)
        } else {
            x
        };

        let windows = window_partition(x, window);
        let bias = self.relative_position_bias(window);
        let mask = (shift > 0).then(|| shift_mask(batch, padded_rows, padded_cols, window, shift, &device));
        let attended = self.attn.forward(windows, Some(bias), mask);
        let x = window_reverse(attended, window, batch, padded_rows, padded_cols, channels);

        let x = if shift > 0 {
            roll(roll(x, shift as isize, 1), shift as isize, 2)
        } else {
            x
        };
        let x = x.narrow(1, 0, rows).narrow(2, 0, cols);
        let x = shortcut + x;
        x.clone() + self.mlp.forward(self.norm2.forward(x))
    }

    /// Bias of shape `(1, heads, window², window²)` gathered from the table.
    fn relative_position_bias(&self, window: usize) -> Tensor<B, 4> {
        let table = self.relative_bias.val();
        let device = table.device();
        let [_, heads] = table.dims();
        let tokens = window * window;
        let index = relative_position_index(window, self.window_size);
        let index = Tensor::<B, 1, Int>::from_data(TensorData::new(index, [tokens * tokens]), &device);
        table
            .select(0, index)
            .reshape([tokens, tokens, heads])
            .permute([2, 0, 1])
            .unsqueeze_dim(0)
    }
}

impl<B: Backend> ResetParameters<B> for SwinBlock<B> {
    fn reset_parameters(&mut self, init: &mut WeightInitializer) {
        init.init_children(vec![
            &mut self.norm1 as &mut dyn WeightInit<B>,
            &mut self.attn,
            &mut self.norm2,
            &mut self.mlp,
        ]);
        init.truncated_normal(&mut self.relative_bias, 0.02);
    }
}

impl<B: Backend> WeightInit<B> for SwinBlock<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::CustomReset(self)
    }
}

/// 2x2 neighbourhood concat + linear reduction: `(B, H, W, C) → (B, H/2, W/2, 2C)`.
#[derive(Module, Debug)]
pub struct PatchMerging<B: Backend> {
    norm: LayerNorm<B>,
    reduction: Linear<B>,
}

impl<B: Backend> PatchMerging<B> {
    fn new(dim: usize, device: &B::Device) -> Self {
        Self {
            norm: LayerNormConfig::new(4 * dim).init(device),
            reduction: LinearConfig::new(4 * dim, 2 * dim).with_bias(false).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, rows, cols, _] = x.dims();
        let x = pad_to(x, rows.div_ceil(2) * 2, cols.div_ceil(2) * 2);
        let [batch, rows, cols, channels] = x.dims();
        let x = x
            .reshape([batch, rows / 2, 2, cols / 2, 2, channels])
            .permute([0, 1, 3, 4, 2, 5])
            .reshape([batch, rows / 2, cols / 2, 4 * channels]);
        self.reduction.forward(self.norm.forward(x))
    }
}

impl<B: Backend> WeightInit<B> for PatchMerging<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(vec![&mut self.norm as &mut dyn WeightInit<B>, &mut self.reduction])
    }
}

/// Cyclic shift along `dim`; positive shifts move elements to higher indices.
fn roll<B: Backend, const D: usize>(x: Tensor<B, D>, shift: isize, dim: usize) -> Tensor<B, D> {
    let size = x.dims()[dim];
    let shift = shift.rem_euclid(size as isize) as usize;
    if shift == 0 {
        return x;
    }
    Tensor::cat(vec![x.clone().narrow(dim, size - shift, shift), x.narrow(dim, 0, size - shift)], dim)
}

/// Zero-pad rows and columns of a channels-last map up to the given size.
fn pad_to<B: Backend>(x: Tensor<B, 4>, rows: usize, cols: usize) -> Tensor<B, 4> {
    let [batch, h, w, channels] = x.dims();
    let device = x.device();
    let x = if rows > h {
        Tensor::cat(vec![x, Tensor::zeros([batch, rows - h, w, channels], &device)], 1)
    } else {
        x
    };
    if cols > w {
        Tensor::cat(vec![x, Tensor::zeros([batch, rows, cols - w, channels], &device)], 2)
    } else {
        x
    }
}

/// `(B, H, W, C) → (B * windows, window², C)`, windows in row-major order.
fn window_partition<B: Backend>(x: Tensor<B, 4>, window: usize) -> Tensor<B, 3> {
    let [batch, rows, cols, channels] = x.dims();
    x.reshape([batch, rows / window, window, cols / window, window, channels])
        .permute([0, 1, 3, 2, 4, 5])
        .reshape([batch * (rows / window) * (cols / window), window * window, channels])
}

fn window_reverse<B: Backend>(
    windows: Tensor<B, 3>,
    window: usize,
    batch: usize,
    rows: usize,
    cols: usize,
    channels: usize,
) -> Tensor<B, 4> {
    windows
        .reshape([batch, rows / window, cols / window, window, window, channels])
        .permute([0, 1, 3, 2, 4, 5])
        .reshape([batch, rows, cols, channels])
}

/// Flattened `(window² x window²)` lookup into a table laid out for `table_window`.
fn relative_position_index(window: usize, table_window: usize) -> Vec<i64> {
    let side = 2 * table_window as i64 - 1;
    let offset = table_window as i64 - 1;
    let coords: Vec<(i64, i64)> = (0..window)
        .flat_map(|y| (0..window).map(move |x| (y as i64, x as i64)))
        .collect();
    coords
        .iter()
        .flat_map(|&(yi, xi)| {
            coords
                .iter()
                .map(move |&(yj, xj)| (yi - yj + offset) * side + (xi - xj + offset))
        })
        .collect()
}

/// Region id of a coordinate after the cyclic shift: 0 body, 1 seam, 2 wrapped.
fn shift_region(i: usize, size: usize, window: usize, shift: usize) -> usize {
    if i < size - window {
        0
    } else if i < size - shift {
        1
    } else {
        2
    }
}

/// Additive mask `(batch * windows, 1, window², window²)` that keeps tokens from
/// attending across regions stitched together by the shift.
fn shift_mask<B: Backend>(
    batch: usize,
    rows: usize,
    cols: usize,
    window: usize,
    shift: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let tokens = window * window;
    let num_windows = (rows / window) * (cols / window);
    let mut per_image = Vec::with_capacity(num_windows * tokens * tokens);
    for wy in 0..rows / window {
        for wx in 0..cols / window {
            let ids: Vec<usize> = (0..tokens)
                .map(|t| {
                    let y = wy * window + t / window;
                    let x = wx * window + t % window;
                    shift_region(y, rows, window, shift) * 3 + shift_region(x, cols, window, shift)
                })
                .collect();
            for &a in &ids {
                for &b in &ids {
                    per_image.push(if a == b { 0.0 } else { SHIFT_MASK_VALUE });
                }
            }
        }
    }
    let data: Vec<f32> = per_image.iter().copied().cycle().take(batch * per_image.len()).collect();
    Tensor::from_data(TensorData::new(data, [batch * num_windows, 1, tokens, tokens]), device)
}
