//! Residual networks without a classification layer.
//!
//! ```text
//! (batch, 3, H, W)
//!   → stem: conv7x7/2 → BN → ReLU → maxpool3x3/2      (cifar: conv3x3/1 pad 2, no pool)
//!   → 4 stages of Basic or Bottleneck blocks (64, 128, 256, 512 planes)
//!   → [large variants] BottleneckExpand(trunk width → out_size)
//!   → global average pool
//!   → features: (batch, num_features)
//! ```

use std::f64::consts::SQRT_2;

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};

use crate::init::{Layer, ResetParameters, WeightInit, WeightInitializer};
use crate::FeatureExtractor;

const STAGE_PLANES: [usize; 4] = [64, 128, 256, 512];

/// Residual block flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Basic,
    Bottleneck,
}

impl BlockKind {
    pub fn expansion(&self) -> usize {
        match self {
            BlockKind::Basic => 1,
            BlockKind::Bottleneck => 4,
        }
    }
}

/// Configuration for a [`ResNet`] trunk.
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Block type used in every stage.
    pub block: BlockKind,
    /// Number of blocks per stage.
    pub layers: Vec<usize>,
    /// Bottleneck width per group (64 for standard, 128+ for wide variants).
    #[config(default = 64)]
    pub width_per_group: usize,
    /// Small-image stem: 3x3 stride-1 conv with padding 2 and no max-pool.
    #[config(default = false)]
    pub cifar: bool,
    /// Zero the last batch-norm scale of each block.
    #[config(default = false)]
    pub zero_init_residual: bool,
    /// Output width of the channel-expanding head, if any.
    pub expand_to: Option<usize>,
    /// Seed for host-side initialization of the expanding head.
    #[config(default = 0)]
    pub seed: u64,
}

impl ResNetConfig {
    pub fn resnet18() -> Self {
        Self::new(BlockKind::Basic, vec![2, 2, 2, 2])
    }

    pub fn resnet50() -> Self {
        Self::new(BlockKind::Bottleneck, vec![3, 4, 6, 3])
    }

    /// Channel width at the end of the trunk.
    pub fn trunk_width(&self) -> usize {
        let stages = self.layers.len().clamp(1, STAGE_PLANES.len());
        STAGE_PLANES[stages - 1] * self.block.expansion()
    }

    /// Width of the pooled feature vector.
    pub fn num_features(&self) -> usize {
        self.expand_to.unwrap_or_else(|| self.trunk_width())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let (conv1, maxpool) = if self.cifar {
            let conv = Conv2dConfig::new([3, 64], [3, 3])
                .with_stride([1, 1])
                .with_padding(PaddingConfig2d::Explicit(2, 2))
                .with_bias(false)
                .with_initializer(kaiming())
                .init(device);
            (conv, None)
        } else {
            let conv = Conv2dConfig::new([3, 64], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .with_initializer(kaiming())
                .init(device);
            let pool = MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init();
            (conv, Some(pool))
        };

        let mut inplanes = 64;
        let mut stages = Vec::with_capacity(self.layers.len());
        for (i, (&blocks, planes)) in self.layers.iter().zip(STAGE_PLANES).enumerate() {
            let stride = if i == 0 { 1 } else { 2 };
            stages.push(self.make_stage(planes, blocks, stride, &mut inplanes, device));
        }

        let expand = self.expand_to.map(|out_channels| {
            BottleneckExpandConfig::new(inplanes, out_channels)
                .with_seed(self.seed)
                .init(device)
        });

        ResNet {
            conv1,
            bn1: BatchNormConfig::new(64).init(device),
            maxpool,
            stages,
            expand,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            num_features: self.num_features(),
        }
    }

    fn make_stage<B: Backend>(
        &self,
        planes: usize,
        blocks: usize,
        stride: usize,
        inplanes: &mut usize,
        device: &B::Device,
    ) -> ResidualStage<B> {
        let out_channels = planes * self.block.expansion();
        let downsample = (stride != 1 || *inplanes != out_channels)
            .then(|| Downsample::new(*inplanes, out_channels, stride, device));

        let mut list = Vec::with_capacity(blocks);
        list.push(self.make_block(*inplanes, planes, stride, downsample, device));
        *inplanes = out_channels;
        for _ in 1..blocks {
            list.push(self.make_block(*inplanes, planes, 1, None, device));
        }
        ResidualStage { blocks: list }
    }

    fn make_block<B: Backend>(
        &self,
        inplanes: usize,
        planes: usize,
        stride: usize,
        downsample: Option<Downsample<B>>,
        device: &B::Device,
    ) -> ResidualBlock<B> {
        match self.block {
            BlockKind::Basic => {
                let mut block = BasicBlock {
                    conv1: conv3x3(inplanes, planes, stride, device),
                    bn1: BatchNormConfig::new(planes).init(device),
                    conv2: conv3x3(planes, planes, 1, device),
                    bn2: BatchNormConfig::new(planes).init(device),
                    downsample,
                };
                if self.zero_init_residual {
                    zero_gamma(&mut block.bn2);
                }
                ResidualBlock::Basic(block)
            }
            BlockKind::Bottleneck => {
                let width = planes * self.width_per_group / 64;
                let out_channels = planes * self.block.expansion();
                let mut block = BottleneckBlock {
                    conv1: conv1x1(inplanes, width, 1, device),
                    bn1: BatchNormConfig::new(width).init(device),
                    conv2: conv3x3(width, width, stride, device),
                    bn2: BatchNormConfig::new(width).init(device),
                    conv3: conv1x1(width, out_channels, 1, device),
                    bn3: BatchNormConfig::new(out_channels).init(device),
                    downsample,
                };
                if self.zero_init_residual {
                    zero_gamma(&mut block.bn3);
                }
                ResidualBlock::Bottleneck(block)
            }
        }
    }
}

/// Kaiming-normal, fan-out, ReLU gain.
fn kaiming() -> Initializer {
    Initializer::KaimingNormal { gain: SQRT_2, fan_out_only: true }
}

fn conv3x3<B: Backend>(inp: usize, out: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([inp, out], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .with_initializer(kaiming())
        .init(device)
}

fn conv1x1<B: Backend>(inp: usize, out: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([inp, out], [1, 1])
        .with_stride([stride, stride])
        .with_bias(false)
        .with_initializer(kaiming())
        .init(device)
}

fn zero_gamma<B: Backend>(bn: &mut BatchNorm<B, 2>) {
    let gamma = bn.gamma.val();
    bn.gamma = Param::from_tensor(Tensor::zeros(gamma.dims(), &gamma.device()));
}

/// Projection shortcut: 1x1 conv + BN.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    fn new(inp: usize, out: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: conv1x1(inp, out, stride, device),
            bn: BatchNormConfig::new(out).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(down) => down.forward(x.clone()),
            None => x.clone(),
        };
        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        relu(out + identity)
    }
}

#[derive(Module, Debug)]
pub struct BottleneckBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> BottleneckBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(down) => down.forward(x.clone()),
            None => x.clone(),
        };
        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = relu(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));
        relu(out + identity)
    }
}

#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    Basic(BasicBlock<B>),
    Bottleneck(BottleneckBlock<B>),
}

impl<B: Backend> ResidualBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            ResidualBlock::Basic(block) => block.forward(x),
            ResidualBlock::Bottleneck(block) => block.forward(x),
        }
    }
}

#[derive(Module, Debug)]
pub struct ResidualStage<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> ResidualStage<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }
}

/// Residual trunk whose classification layer is the identity.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    maxpool: Option<MaxPool2d>,
    stages: Vec<ResidualStage<B>>,
    expand: Option<BottleneckExpand<B>>,
    avgpool: AdaptiveAvgPool2d,
    num_features: usize,
}

impl<B: Backend> ResNet<B> {
    /// False when the small-image stem is in use.
    pub fn has_maxpool(&self) -> bool {
        self.maxpool.is_some()
    }
}

impl<B: Backend> FeatureExtractor<B> for ResNet<B> {
    fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.bn1.forward(self.conv1.forward(images)));
        let x = match &self.maxpool {
            Some(pool) => pool.forward(x),
            None => x,
        };
        let x = self.stages.iter().fold(x, |x, stage| stage.forward(x));
        let x = match &self.expand {
            Some(expand) => expand.forward(x),
            None => x,
        };
        let [batch, channels, _, _] = x.dims();
        self.avgpool.forward(x).reshape([batch, channels])
    }

    fn num_features(&self) -> usize {
        self.num_features
    }
}

/// Configuration for [`BottleneckExpand`].
#[derive(Config, Debug)]
pub struct BottleneckExpandConfig {
    /// Trunk width entering the head.
    pub in_channels: usize,
    /// Output feature width.
    pub out_channels: usize,
    #[config(default = 512)]
    pub hidden_channels: usize,
    #[config(default = 0)]
    pub seed: u64,
}

impl BottleneckExpandConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BottleneckExpand<B> {
        let hidden = self.hidden_channels;
        let residual = self.out_channels % self.in_channels == 0;
        let mut head = BottleneckExpand {
            conv1: conv1x1(self.in_channels, hidden, 1, device),
            bn1: BatchNormConfig::new(hidden).init(device),
            conv2: conv3x3(hidden, hidden, 1, device),
            bn2: BatchNormConfig::new(hidden).init(device),
            conv3: conv1x1(hidden, self.out_channels, 1, device),
            bn3: BatchNormConfig::new(self.out_channels).init(device),
            expansion: if residual { self.out_channels / self.in_channels } else { 0 },
        };
        WeightInitializer::new(self.seed).weights_init(&mut head);
        head
    }
}

/// Channel-expanding residual bottleneck placed before global pooling.
///
/// When the output width is a multiple of the input width the identity is
/// tiled along channels and added back.
#[derive(Module, Debug)]
pub struct BottleneckExpand<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    /// Identity tiling factor; 0 when the head is not residual.
    expansion: usize,
}

impl<B: Backend> BottleneckExpand<B> {
    pub fn is_residual(&self) -> bool {
        self.expansion > 0
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = self.is_residual().then(|| Tensor::cat(vec![x.clone(); self.expansion], 1));
        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = relu(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));
        match identity {
            Some(identity) => relu(out + identity),
            None => relu(out),
        }
    }

    /// Std of the random projection applied to `conv1`.
    pub fn projection_std(&self) -> f64 {
        let [out_channels, _, _, _] = self.conv1.weight.val().dims();
        1.0 / (out_channels as f64).sqrt()
    }
}

impl<B: Backend> ResetParameters<B> for BottleneckExpand<B> {
    fn reset_parameters(&mut self, init: &mut WeightInitializer) {
        init.init_children(vec![
            &mut self.conv1 as &mut dyn WeightInit<B>,
            &mut self.bn1,
            &mut self.conv2,
            &mut self.bn2,
            &mut self.conv3,
            &mut self.bn3,
        ]);
        // Johnson-Lindenstrauss style random projection on the first 1x1 conv.
        let std = self.projection_std();
        init.normal(&mut self.conv1.weight, std);
    }
}

impl<B: Backend> WeightInit<B> for BottleneckExpand<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::CustomReset(self)
    }
}
