//! Subcommand implementations.

use std::path::PathBuf;
use std::time::Instant;

use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::backend::Autodiff;
use methods::optim::validate_optimizer_settings;
use methods::{
    fit, BaseMethod, EpochMetricLogger, MethodConfig, MomentumMethod, MomentumMethodConfig, SyntheticDataConfig,
    SyntheticDataModule, TrainerConfig,
};

use crate::config::{
    build_data_config, build_method_config, build_momentum_config, build_trainer_config, load_run_toml,
    CliOverrides, RunToml,
};

type TrainBackend = Autodiff<NdArray<f32>>;

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    /// Path to the run config TOML file.
    pub config: PathBuf,
    pub overrides: CliOverrides,
}

/// Resolved configuration of one run.
struct RunPlan {
    method: MethodConfig,
    momentum: Option<MomentumMethodConfig>,
    trainer: TrainerConfig,
    data: SyntheticDataConfig,
}

fn plan(run: &RunToml, cli: &CliOverrides) -> anyhow::Result<RunPlan> {
    let method = build_method_config(&run.method, cli)?;
    let data = build_data_config(&run.data, &method);
    let trainer = build_trainer_config(&run.trainer, cli);
    let momentum = run.momentum.as_ref().map(|m| build_momentum_config(method.clone(), m));
    Ok(RunPlan { method, momentum, trainer, data })
}

/// Train a method on synthetic data and print the last epoch's metrics.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let run = load_run_toml(&args.config)?;
    let plan = plan(&run, &args.overrides)?;

    let device = NdArrayDevice::default();
    let data = SyntheticDataModule::<TrainBackend>::new(plan.data, device);
    let mut logger = EpochMetricLogger::new();

    match plan.momentum {
        Some(config) => {
            let mut method = MomentumMethod::<TrainBackend>::new(config)?;
            fit(&plan.trainer, &mut method, &data, &mut logger, &device)?;
        }
        None => {
            let mut method = BaseMethod::<TrainBackend>::new(plan.method)?;
            fit(&plan.trainer, &mut method, &data, &mut logger, &device)?;
        }
    }

    println!("\n--- Training Summary ---");
    if let Some(metrics) = logger.history().last() {
        for (name, value) in metrics {
            println!("{name}: {value:.4}");
        }
    }
    println!("Epochs: {}", logger.history().len());
    println!("Checkpoints: {}", plan.trainer.checkpoint_dir);
    println!("Time: {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Resolve and validate a run config without training.
pub fn run_check_config(config: PathBuf) -> anyhow::Result<()> {
    let run = load_run_toml(&config)?;
    let plan = plan(&run, &CliOverrides::default())?;
    validate_optimizer_settings(&plan.method)?;

    let base = BaseMethod::<TrainBackend>::new(plan.method)?;
    if let Some(config) = plan.momentum {
        let momentum = MomentumMethod::<TrainBackend>::new(config)?;
        let updater = momentum.updater();
        println!("Momentum: tau {} -> {}", updater.base_tau(), updater.final_tau());
    }
    let method = base.config();

    println!("Backbone: {} ({} features)", base.architecture(), base.features_dim());
    println!("Crops: {} large + {} small", method.num_large_crops, method.num_small_crops);
    println!(
        "Optimizer: {}{} lr={} classifier_lr={} weight_decay={}",
        method.optimizer,
        if method.lars { " + LARS" } else { "" },
        method.lr,
        method.classifier_lr,
        method.weight_decay
    );
    println!("Scheduler: {}", method.scheduler);
    println!("Epochs: {}", method.max_epochs);
    println!("Config OK");
    Ok(())
}

/// Print every registered backbone with its feature-width rule.
pub fn run_list_backbones() -> anyhow::Result<()> {
    for spec in backbones::registry() {
        println!("{:<24} {:?}", spec.name, spec.feature_dim);
    }
    Ok(())
}
