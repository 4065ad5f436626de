//! Name → architecture lookup and per-family construction rules.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::convnext::ConvNextConfig;
use crate::poolformer::PoolFormerConfig;
use crate::resnet::ResNetConfig;
use crate::swin::SwinConfig;
use crate::vit::VitConfig;
use crate::{Backbone, BackboneError};

/// Window side Swin uses on 32x32 inputs.
pub const CIFAR_SWIN_WINDOW: usize = 4;

/// Construction arguments shared by every family. Each family reads the
/// fields that apply to it and ignores the rest.
#[derive(Config, Debug)]
pub struct BackboneArgs {
    /// Small-image variant (stem patch for residual nets, 4x4 windows for Swin).
    #[config(default = false)]
    pub cifar: bool,
    /// Zero the last norm scale of every residual block.
    #[config(default = false)]
    pub zero_init_residual: bool,
    /// ViT patch side.
    #[config(default = 16)]
    pub patch_size: usize,
    /// ViT input resolution.
    #[config(default = 224)]
    pub img_size: usize,
    /// Swin window override.
    pub window_size: Option<usize>,
    /// Seed for host-side weight initialization.
    #[config(default = 0)]
    pub seed: u64,
}

/// Every registered backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Architecture {
    Resnet18,
    Resnet50,
    WideResnet50x2,
    WideResnet50x4,
    WideResnet50x8,
    ResnetLarge1,
    ResnetLarge2,
    VitTiny,
    VitSmall,
    VitBase,
    VitLarge,
    SwinTiny,
    SwinSmall,
    SwinBase,
    SwinLarge,
    PoolformerS12,
    PoolformerS24,
    PoolformerS36,
    PoolformerM36,
    PoolformerM48,
    ConvnextTiny,
    ConvnextSmall,
    ConvnextBase,
    ConvnextLarge,
}

impl Architecture {
    pub const ALL: [Architecture; 24] = [
        Architecture::Resnet18,
        Architecture::Resnet50,
        Architecture::WideResnet50x2,
        Architecture::WideResnet50x4,
        Architecture::WideResnet50x8,
        Architecture::ResnetLarge1,
        Architecture::ResnetLarge2,
        Architecture::VitTiny,
        Architecture::VitSmall,
        Architecture::VitBase,
        Architecture::VitLarge,
        Architecture::SwinTiny,
        Architecture::SwinSmall,
        Architecture::SwinBase,
        Architecture::SwinLarge,
        Architecture::PoolformerS12,
        Architecture::PoolformerS24,
        Architecture::PoolformerS36,
        Architecture::PoolformerM36,
        Architecture::PoolformerM48,
        Architecture::ConvnextTiny,
        Architecture::ConvnextSmall,
        Architecture::ConvnextBase,
        Architecture::ConvnextLarge,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Resnet18 => "resnet18",
            Architecture::Resnet50 => "resnet50",
            Architecture::WideResnet50x2 => "wide_resnet50_2",
            Architecture::WideResnet50x4 => "wide_resnet50_4",
            Architecture::WideResnet50x8 => "wide_resnet50_8",
            Architecture::ResnetLarge1 => "resnetlarge1",
            Architecture::ResnetLarge2 => "resnetlarge2",
            Architecture::VitTiny => "vit_tiny",
            Architecture::VitSmall => "vit_small",
            Architecture::VitBase => "vit_base",
            Architecture::VitLarge => "vit_large",
            Architecture::SwinTiny => "swin_tiny",
            Architecture::SwinSmall => "swin_small",
            Architecture::SwinBase => "swin_base",
            Architecture::SwinLarge => "swin_large",
            Architecture::PoolformerS12 => "poolformer_s12",
            Architecture::PoolformerS24 => "poolformer_s24",
            Architecture::PoolformerS36 => "poolformer_s36",
            Architecture::PoolformerM36 => "poolformer_m36",
            Architecture::PoolformerM48 => "poolformer_m48",
            Architecture::ConvnextTiny => "convnext_tiny",
            Architecture::ConvnextSmall => "convnext_small",
            Architecture::ConvnextBase => "convnext_base",
            Architecture::ConvnextLarge => "convnext_large",
        }
    }

    pub fn feature_dim_rule(&self) -> FeatureDimRule {
        match self {
            Architecture::Resnet18
            | Architecture::Resnet50
            | Architecture::WideResnet50x2
            | Architecture::WideResnet50x4
            | Architecture::WideResnet50x8 => FeatureDimRule::Inplanes,
            Architecture::ResnetLarge1 | Architecture::ResnetLarge2 => FeatureDimRule::OutSize,
            _ => FeatureDimRule::NumFeatures,
        }
    }

    /// Resolve the family-specific configuration for these arguments.
    pub fn family(&self, args: &BackboneArgs, out_size: usize) -> ArchitectureFamily {
        let residual = |config: ResNetConfig| {
            config
                .with_cifar(args.cifar)
                .with_zero_init_residual(args.zero_init_residual)
                .with_seed(args.seed)
        };
        let vit = |config: VitConfig| {
            ArchitectureFamily::VisionTransformer(
                config
                    .with_patch_size(args.patch_size)
                    .with_img_size(args.img_size)
                    .with_seed(args.seed),
            )
        };
        let swin = |config: SwinConfig| {
            let window = if args.cifar {
                CIFAR_SWIN_WINDOW
            } else {
                args.window_size.unwrap_or(config.window_size)
            };
            ArchitectureFamily::Swin(config.with_window_size(window).with_seed(args.seed))
        };
        let poolformer = |config: PoolFormerConfig| ArchitectureFamily::PoolFormer(config.with_seed(args.seed));
        let convnext = |config: ConvNextConfig| ArchitectureFamily::ConvNext(config.with_seed(args.seed));

        match self {
            Architecture::Resnet18 => ArchitectureFamily::Residual(residual(ResNetConfig::resnet18())),
            Architecture::Resnet50 => ArchitectureFamily::Residual(residual(ResNetConfig::resnet50())),
            Architecture::WideResnet50x2 => ArchitectureFamily::Residual(residual(
                ResNetConfig::resnet50().with_width_per_group(128),
            )),
            Architecture::WideResnet50x4 => ArchitectureFamily::Residual(residual(
                ResNetConfig::resnet50().with_width_per_group(256),
            )),
            Architecture::WideResnet50x8 => ArchitectureFamily::Residual(residual(
                ResNetConfig::resnet50().with_width_per_group(512),
            )),
            Architecture::ResnetLarge1 => ArchitectureFamily::LargeResidual(residual(
                ResNetConfig::resnet18().with_expand_to(Some(out_size)),
            )),
            Architecture::ResnetLarge2 => ArchitectureFamily::LargeResidual(residual(
                ResNetConfig::resnet50().with_expand_to(Some(out_size)),
            )),
            Architecture::VitTiny => vit(VitConfig::tiny()),
            Architecture::VitSmall => vit(VitConfig::small()),
            Architecture::VitBase => vit(VitConfig::base()),
            Architecture::VitLarge => vit(VitConfig::large()),
            Architecture::SwinTiny => swin(SwinConfig::tiny()),
            Architecture::SwinSmall => swin(SwinConfig::small()),
            Architecture::SwinBase => swin(SwinConfig::base()),
            Architecture::SwinLarge => swin(SwinConfig::large()),
            Architecture::PoolformerS12 => poolformer(PoolFormerConfig::s12()),
            Architecture::PoolformerS24 => poolformer(PoolFormerConfig::s24()),
            Architecture::PoolformerS36 => poolformer(PoolFormerConfig::s36()),
            Architecture::PoolformerM36 => poolformer(PoolFormerConfig::m36()),
            Architecture::PoolformerM48 => poolformer(PoolFormerConfig::m48()),
            Architecture::ConvnextTiny => convnext(ConvNextConfig::tiny()),
            Architecture::ConvnextSmall => convnext(ConvNextConfig::small()),
            Architecture::ConvnextBase => convnext(ConvNextConfig::base()),
            Architecture::ConvnextLarge => convnext(ConvNextConfig::large()),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = BackboneError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Architecture::ALL
            .iter()
            .copied()
            .find(|arch| arch.name() == name)
            .ok_or_else(|| BackboneError::UnknownArchitecture {
                name: name.to_string(),
                available: Architecture::ALL.iter().map(|a| a.name()).collect::<Vec<_>>().join(", "),
            })
    }
}

impl TryFrom<String> for Architecture {
    type Error = BackboneError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        name.parse()
    }
}

impl From<Architecture> for String {
    fn from(arch: Architecture) -> Self {
        arch.name().to_string()
    }
}

/// Where a backbone's pooled feature width comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureDimRule {
    /// Trunk width after the last residual stage.
    Inplanes,
    /// The configured `out_size` of the channel-expanding head.
    OutSize,
    /// The model's own `num_features`.
    NumFeatures,
}

/// Static registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackboneSpec {
    pub architecture: Architecture,
    pub name: &'static str,
    pub feature_dim: FeatureDimRule,
}

/// The full registry, in declaration order.
pub fn registry() -> Vec<BackboneSpec> {
    Architecture::ALL
        .iter()
        .map(|&architecture| BackboneSpec {
            architecture,
            name: architecture.name(),
            feature_dim: architecture.feature_dim_rule(),
        })
        .collect()
}

/// A resolved family configuration, ready to build.
#[derive(Debug, Clone)]
pub enum ArchitectureFamily {
    Residual(ResNetConfig),
    LargeResidual(ResNetConfig),
    VisionTransformer(VitConfig),
    Swin(SwinConfig),
    PoolFormer(PoolFormerConfig),
    ConvNext(ConvNextConfig),
}

impl ArchitectureFamily {
    /// Pooled feature width, computed without building the model.
    pub fn features_dim(&self) -> usize {
        match self {
            ArchitectureFamily::Residual(config) => config.trunk_width(),
            ArchitectureFamily::LargeResidual(config) => config.num_features(),
            ArchitectureFamily::VisionTransformer(config) => config.num_features(),
            ArchitectureFamily::Swin(config) => config.num_features(),
            ArchitectureFamily::PoolFormer(config) => config.num_features(),
            ArchitectureFamily::ConvNext(config) => config.num_features(),
        }
    }

    fn validate(&self) -> Result<(), BackboneError> {
        match self {
            ArchitectureFamily::LargeResidual(config) if config.num_features() == 0 => {
                Err(BackboneError::InvalidArgument("out_size must be positive".into()))
            }
            ArchitectureFamily::VisionTransformer(config) if config.patch_size == 0 => {
                Err(BackboneError::InvalidArgument("patch_size must be positive".into()))
            }
            ArchitectureFamily::Swin(config) if config.window_size == 0 => {
                Err(BackboneError::InvalidArgument("window_size must be positive".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        match self {
            ArchitectureFamily::Residual(config) | ArchitectureFamily::LargeResidual(config) => {
                Backbone::ResNet(config.init(device))
            }
            ArchitectureFamily::VisionTransformer(config) => Backbone::Vit(config.init(device)),
            ArchitectureFamily::Swin(config) => Backbone::Swin(config.init(device)),
            ArchitectureFamily::PoolFormer(config) => Backbone::PoolFormer(config.init(device)),
            ArchitectureFamily::ConvNext(config) => Backbone::ConvNext(config.init(device)),
        }
    }
}

/// Build a backbone and report its feature width.
pub fn build_backbone<B: Backend>(
    architecture: Architecture,
    args: &BackboneArgs,
    out_size: usize,
    device: &B::Device,
) -> Result<(Backbone<B>, usize), BackboneError> {
    let family = architecture.family(args, out_size);
    family.validate()?;
    let features_dim = family.features_dim();
    let backbone = family.init(device);
    tracing::debug!(%architecture, features_dim, cifar = args.cifar, "Built backbone");
    Ok((backbone, features_dim))
}
