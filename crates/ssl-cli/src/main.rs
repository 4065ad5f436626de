mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::CliOverrides;
use pipeline::TrainArgs;

/// ssl: self-supervised pretraining with online linear and k-NN evaluation.
#[derive(Parser)]
#[command(name = "ssl", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a method on synthetic multi-crop data.
    Train {
        /// Path to run config TOML file.
        #[arg(long, default_value = "configs/base.toml")]
        config: PathBuf,
        /// Override the backbone architecture.
        #[arg(long)]
        backbone: Option<String>,
        /// Override the number of training epochs.
        #[arg(long)]
        max_epochs: Option<usize>,
        /// Override the backbone learning rate.
        #[arg(long)]
        lr: Option<f64>,
        /// Override the checkpoint directory.
        #[arg(long)]
        checkpoint_dir: Option<String>,
        /// Resume from the checkpoint saved after this epoch.
        #[arg(long)]
        resume_epoch: Option<usize>,
        /// Hide the per-epoch progress bar.
        #[arg(long)]
        no_progress: bool,
    },
    /// Resolve a run config and validate it without training.
    CheckConfig {
        /// Path to run config TOML file.
        #[arg(long)]
        config: PathBuf,
    },
    /// List registered backbone architectures.
    ListBackbones,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train { config, backbone, max_epochs, lr, checkpoint_dir, resume_epoch, no_progress } => {
            pipeline::run_train(TrainArgs {
                config,
                overrides: CliOverrides { backbone, max_epochs, lr, checkpoint_dir, resume_epoch, no_progress },
            })
        }
        Command::CheckConfig { config } => pipeline::run_check_config(config),
        Command::ListBackbones => pipeline::run_list_backbones(),
    }
}
