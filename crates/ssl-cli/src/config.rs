//! TOML run configuration for the `ssl` CLI.
//!
//! A run file has `[method]`, `[momentum]`, `[trainer]` and `[data]` sections,
//! every field optional. Values are merged onto the library defaults, and CLI
//! flags win over the file. A `[momentum]` section, even an empty one, selects
//! the momentum method.

use std::path::Path;

use backbones::BackboneArgs;
use methods::config::ExtraOptimizerArgs;
use methods::{MethodConfig, MomentumMethodConfig, SyntheticDataConfig, TrainerConfig};
use serde::Deserialize;

/// Top-level structure matching `configs/*.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunToml {
    #[serde(default)]
    pub method: MethodOverrides,
    /// Present only for methods with an EMA backbone.
    pub momentum: Option<MomentumOverrides>,
    #[serde(default)]
    pub trainer: TrainerOverrides,
    #[serde(default)]
    pub data: DataOverrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodOverrides {
    pub backbone: Option<String>,
    pub num_classes: Option<usize>,
    pub max_epochs: Option<usize>,
    /// Small-image stem for residual backbones, window 4 for Swin.
    pub cifar: Option<bool>,
    pub zero_init_residual: Option<bool>,
    pub patch_size: Option<usize>,
    pub img_size: Option<usize>,
    pub window_size: Option<usize>,
    pub out_size: Option<usize>,
    pub batch_size: Option<usize>,
    pub optimizer: Option<String>,
    pub lr: Option<f64>,
    pub classifier_lr: Option<f64>,
    pub weight_decay: Option<f64>,
    /// SGD / LARS momentum.
    pub momentum: Option<f64>,
    pub nesterov: Option<bool>,
    pub beta_1: Option<f32>,
    pub beta_2: Option<f32>,
    pub lars: Option<bool>,
    pub eta_lars: Option<f64>,
    pub grad_clip_lars: Option<bool>,
    pub exclude_bias_n_norm: Option<bool>,
    pub scheduler: Option<String>,
    pub lr_decay_steps: Option<Vec<usize>>,
    pub min_lr: Option<f64>,
    pub warmup_start_lr: Option<f64>,
    pub warmup_epochs: Option<usize>,
    pub num_large_crops: Option<usize>,
    pub num_small_crops: Option<usize>,
    pub knn_eval: Option<bool>,
    pub knn_k: Option<usize>,
    pub accumulate_grad_batches: Option<usize>,
    /// Seed for backbone weight initialization.
    pub seed: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MomentumOverrides {
    pub base_tau_momentum: Option<f64>,
    pub final_tau_momentum: Option<f64>,
    pub momentum_classifier: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerOverrides {
    pub num_sanity_val_steps: Option<usize>,
    pub checkpoint_dir: Option<String>,
    pub checkpoint_interval: Option<usize>,
    pub progress: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataOverrides {
    pub train_samples: Option<usize>,
    pub val_samples: Option<usize>,
    pub image_size: Option<usize>,
    pub small_crop_size: Option<usize>,
    pub noise: Option<f32>,
    pub unlabeled_fraction: Option<f64>,
    pub seed: Option<u64>,
}

/// Flags that take priority over the TOML file.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub backbone: Option<String>,
    pub max_epochs: Option<usize>,
    pub lr: Option<f64>,
    pub checkpoint_dir: Option<String>,
    pub resume_epoch: Option<usize>,
    pub no_progress: bool,
}

/// Load and deserialize a `RunToml` from a TOML file.
pub fn load_run_toml(path: &Path) -> anyhow::Result<RunToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
    let config: RunToml =
        toml::from_str(&contents).map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), momentum = config.momentum.is_some(), "Loaded run config");
    Ok(config)
}

/// Assign `$src.$field` to `$dst.$field` when it is set.
macro_rules! apply {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $src.$field.clone() {
                $dst.$field = value;
            }
        )+
    };
}

/// Build a `MethodConfig` from library defaults, TOML values and CLI flags.
///
/// `backbone`, `num_classes` and `max_epochs` have no default and must come
/// from one of the two.
pub fn build_method_config(overrides: &MethodOverrides, cli: &CliOverrides) -> anyhow::Result<MethodConfig> {
    let backbone = cli
        .backbone
        .clone()
        .or_else(|| overrides.backbone.clone())
        .ok_or_else(|| anyhow::anyhow!("no backbone given: set method.backbone or pass --backbone"))?;
    let num_classes = overrides.num_classes.ok_or_else(|| anyhow::anyhow!("method.num_classes is required"))?;
    let max_epochs = cli
        .max_epochs
        .or(overrides.max_epochs)
        .ok_or_else(|| anyhow::anyhow!("no epoch count given: set method.max_epochs or pass --max-epochs"))?;

    let mut backbone_args = BackboneArgs::new();
    apply!(backbone_args, overrides, cifar, zero_init_residual, patch_size, img_size, seed);
    if overrides.window_size.is_some() {
        backbone_args.window_size = overrides.window_size;
    }

    let mut extra = ExtraOptimizerArgs::new();
    apply!(extra, overrides, momentum, nesterov, beta_1, beta_2);

    let mut config = MethodConfig::new(backbone, num_classes, max_epochs)
        .with_backbone_args(backbone_args)
        .with_extra_optimizer_args(extra);
    apply!(
        config,
        overrides,
        out_size,
        batch_size,
        optimizer,
        lr,
        classifier_lr,
        weight_decay,
        lars,
        eta_lars,
        grad_clip_lars,
        exclude_bias_n_norm,
        scheduler,
        min_lr,
        warmup_start_lr,
        warmup_epochs,
        num_large_crops,
        num_small_crops,
        knn_eval,
        knn_k,
    );
    if overrides.lr_decay_steps.is_some() {
        config.lr_decay_steps = overrides.lr_decay_steps.clone();
    }
    if overrides.accumulate_grad_batches.is_some() {
        config.accumulate_grad_batches = overrides.accumulate_grad_batches;
    }

    if let Some(lr) = cli.lr {
        config.lr = lr;
    }
    Ok(config)
}

pub fn build_momentum_config(method: MethodConfig, overrides: &MomentumOverrides) -> MomentumMethodConfig {
    let mut config = MomentumMethodConfig::new(method);
    apply!(config, overrides, base_tau_momentum, final_tau_momentum, momentum_classifier);
    config
}

pub fn build_trainer_config(overrides: &TrainerOverrides, cli: &CliOverrides) -> TrainerConfig {
    let mut config = TrainerConfig::new();
    apply!(config, overrides, num_sanity_val_steps, checkpoint_dir, checkpoint_interval, progress);
    if let Some(dir) = &cli.checkpoint_dir {
        config.checkpoint_dir = dir.clone();
    }
    if cli.no_progress {
        config.progress = false;
    }
    config.resume_epoch = cli.resume_epoch;
    config
}

/// Synthetic data shaped to the method: class count, batch size and crop counts
/// always follow `method`.
pub fn build_data_config(overrides: &DataOverrides, method: &MethodConfig) -> SyntheticDataConfig {
    let mut config = SyntheticDataConfig::new()
        .with_num_classes(method.num_classes)
        .with_batch_size(method.batch_size)
        .with_num_large_crops(method.num_large_crops)
        .with_num_small_crops(method.num_small_crops);
    apply!(config, overrides, train_samples, val_samples, image_size, small_crop_size, noise, unlabeled_fraction, seed);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_full_run_toml() {
        let toml_str = r#"
[method]
backbone = "resnet18"
num_classes = 10
max_epochs = 100
cifar = true
optimizer = "sgd"
lars = true
exclude_bias_n_norm = true
lr = 1.0
classifier_lr = 0.1
momentum = 0.9
scheduler = "step"
lr_decay_steps = [60, 80]
num_small_crops = 6
accumulate_grad_batches = 2

[momentum]
base_tau_momentum = 0.996
momentum_classifier = true

[trainer]
checkpoint_dir = "checkpoints/byol"
checkpoint_interval = 10

[data]
train_samples = 256
image_size = 32
"#;
        let run: RunToml = toml::from_str(toml_str).unwrap();
        let method = build_method_config(&run.method, &CliOverrides::default()).unwrap();
        assert_eq!(method.backbone, "resnet18");
        assert!(method.backbone_args.cifar);
        assert!(method.lars && method.exclude_bias_n_norm);
        assert_eq!(method.lr_decay_steps, Some(vec![60, 80]));
        assert_eq!(method.num_small_crops, 6);
        assert_eq!(method.accumulate_grad_batches, Some(2));
        // accumulation scaling happens when the method is built, not here
        assert!((method.lr - 1.0).abs() < 1e-12);

        let momentum = build_momentum_config(method, run.momentum.as_ref().unwrap());
        assert!((momentum.base_tau_momentum - 0.996).abs() < 1e-12);
        assert!((momentum.final_tau_momentum - 1.0).abs() < 1e-12, "default kept");
        assert!(momentum.momentum_classifier);

        let trainer = build_trainer_config(&run.trainer, &CliOverrides::default());
        assert_eq!(trainer.checkpoint_dir, "checkpoints/byol");
        assert_eq!(trainer.checkpoint_interval, 10);

        let data = build_data_config(&run.data, &momentum.method);
        assert_eq!(data.num_classes, 10);
        assert_eq!(data.num_small_crops, 6);
        assert_eq!(data.image_size, 32);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let toml_str = r#"
[method]
backbone = "vit_tiny"
num_classes = 100
max_epochs = 5
"#;
        let run: RunToml = toml::from_str(toml_str).unwrap();
        assert!(run.momentum.is_none());
        let method = build_method_config(&run.method, &CliOverrides::default()).unwrap();
        assert_eq!(method.optimizer, "sgd");
        assert_eq!(method.scheduler, "warmup_cosine");
        assert_eq!(method.backbone_args.patch_size, 16);
        assert!(method.accumulate_grad_batches.is_none());
    }

    #[test]
    fn test_cli_override_priority() {
        let run: RunToml = toml::from_str(
            r#"
[method]
backbone = "resnet18"
num_classes = 10
max_epochs = 100
lr = 0.5

[trainer]
checkpoint_dir = "from_toml"
"#,
        )
        .unwrap();
        let cli = CliOverrides {
            backbone: Some("resnet50".into()),
            max_epochs: Some(3),
            lr: Some(0.01),
            checkpoint_dir: Some("from_cli".into()),
            resume_epoch: Some(1),
            no_progress: true,
        };
        let method = build_method_config(&run.method, &cli).unwrap();
        assert_eq!(method.backbone, "resnet50");
        assert_eq!(method.max_epochs, 3);
        assert!((method.lr - 0.01).abs() < 1e-12);

        let trainer = build_trainer_config(&run.trainer, &cli);
        assert_eq!(trainer.checkpoint_dir, "from_cli");
        assert_eq!(trainer.resume_epoch, Some(1));
        assert!(!trainer.progress);
    }

    #[test]
    fn test_missing_required_fields() {
        let run: RunToml = toml::from_str("[method]\nnum_classes = 10\nmax_epochs = 1\n").unwrap();
        let err = build_method_config(&run.method, &CliOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("backbone"), "got {err}");

        let run: RunToml = toml::from_str("[method]\nbackbone = \"resnet18\"\nmax_epochs = 1\n").unwrap();
        assert!(build_method_config(&run.method, &CliOverrides::default()).is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: Result<RunToml, _> = toml::from_str("[method]\nbackbone = \"resnet18\"\nlearning_rate = 0.1\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_momentum_section_selects_momentum_method() {
        let run: RunToml = toml::from_str("[momentum]\n").unwrap();
        assert!(run.momentum.is_some());
    }
}
