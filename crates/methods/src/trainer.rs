//! Epoch-based host loop driving a [`TrainingPolicy`].
//!
//! Per epoch: learning rates come from the scheduler, every micro-batch runs
//! forward + backward with the loss divided by the accumulation factor, the
//! optimizer steps at accumulation boundaries (and on the last batch), and the
//! batch-end hook runs after every micro-batch. Validation runs on the inner
//! (non-autodiff) model. Checkpoints hold model weights, per-group optimizer
//! state and a `meta.json` with the epoch and step counters.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};

use crate::batch::StepLoss;
use crate::logging::{EpochMetricLogger, LogOptions, MetricSink, NullSink};
use crate::optim::MethodOptimizer;
use crate::policy::{DataModule, TrainerState, TrainingPolicy};

/// Metadata saved alongside each checkpoint for resuming training.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    /// Last completed epoch.
    pub epoch: usize,
    pub global_step: usize,
}

#[derive(Config, Debug)]
pub struct TrainerConfig {
    /// Validation batches run before training starts; 0 skips the sanity check.
    #[config(default = 2)]
    pub num_sanity_val_steps: usize,
    /// Directory for saving checkpoints.
    #[config(default = "String::from(\"checkpoints/ssl\")")]
    pub checkpoint_dir: String,
    /// Epochs between checkpoint saves; 0 saves only the final checkpoint.
    #[config(default = 0)]
    pub checkpoint_interval: usize,
    /// Show a progress bar over each epoch's batches.
    #[config(default = true)]
    pub progress: bool,
    /// Resume from `{checkpoint_dir}/epoch_{n}`.
    pub resume_epoch: Option<usize>,
}

impl TrainerConfig {
    pub fn epoch_dir(&self, epoch: usize) -> PathBuf {
        Path::new(&self.checkpoint_dir).join(format!("epoch_{epoch}"))
    }

    pub fn final_dir(&self) -> PathBuf {
        Path::new(&self.checkpoint_dir).join("final")
    }
}

fn progress_bar(enabled: bool, len: usize, epoch: usize) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb.set_message(format!("epoch {epoch}"));
    pb
}

/// Run validation over at most `limit` batches and close it with the epoch-end hook.
fn validate<B, P, D>(
    policy: &mut P,
    model: &P::Model,
    data: &D,
    state: &TrainerState,
    sink: &mut dyn MetricSink,
    limit: Option<usize>,
) -> anyhow::Result<()>
where
    B: AutodiffBackend,
    P: TrainingPolicy<B>,
    D: DataModule<B>,
{
    let inner = model.valid();
    let outs = data
        .val_batches()
        .take(limit.unwrap_or(usize::MAX))
        .map(|batch| policy.validation_step(&inner, &batch, state))
        .collect::<Result<Vec<_>, _>>()?;
    policy.validation_epoch_end(outs, state, sink)?;
    Ok(())
}

/// Save model weights, optimizer state and metadata into `dir`.
pub fn save_checkpoint<B, M>(
    dir: &Path,
    model: &M,
    optimizer: &MethodOptimizer<M, B>,
    meta: &CheckpointMeta,
) -> anyhow::Result<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    std::fs::create_dir_all(dir)?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

    model
        .clone()
        .save_file(dir.join("model"), &recorder)
        .map_err(|e| anyhow::anyhow!("Failed to save model to {}: {e}", dir.display()))?;
    optimizer
        .save(dir)
        .map_err(|e| anyhow::anyhow!("Failed to save optimizer to {}: {e}", dir.display()))?;
    serde_json::to_writer(std::fs::File::create(dir.join("meta.json"))?, meta)?;

    tracing::info!(epoch = meta.epoch, global_step = meta.global_step, dir = %dir.display(), "Checkpoint saved");
    Ok(())
}

/// Load model weights from a checkpoint directory onto a freshly built model.
pub fn load_checkpoint<B: Backend, M: Module<B>>(model: M, dir: &Path, device: &B::Device) -> anyhow::Result<M> {
    model
        .load_file(dir.join("model"), &NamedMpkFileRecorder::<FullPrecisionSettings>::new(), device)
        .map_err(|e| anyhow::anyhow!("Failed to load checkpoint from {}: {e}", dir.display()))
}

pub fn read_meta(dir: &Path) -> anyhow::Result<CheckpointMeta> {
    let path = dir.join("meta.json");
    let file =
        std::fs::File::open(&path).map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
    serde_json::from_reader(file).map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))
}

/// Train `policy` on `data` for the method's `max_epochs`.
///
/// # Returns
/// The trained model. Epoch metrics are left in `logger`'s history.
pub fn fit<B, P, D>(
    config: &TrainerConfig,
    policy: &mut P,
    data: &D,
    logger: &mut EpochMetricLogger,
    device: &B::Device,
) -> anyhow::Result<P::Model>
where
    B: AutodiffBackend,
    P: TrainingPolicy<B>,
    D: DataModule<B>,
{
    let max_epochs = policy.config().max_epochs;
    let accumulate = policy.config().accumulation_factor();
    std::fs::create_dir_all(&config.checkpoint_dir)?;

    let mut model = policy.init_model(device)?;
    let mut optim = policy.configure_optimizers(&model)?;
    let mut state = TrainerState::new(max_epochs, data.num_training_batches(), accumulate);
    let mut start_epoch = 0;

    if let Some(epoch) = config.resume_epoch {
        let dir = config.epoch_dir(epoch);
        model = load_checkpoint(model, &dir, device)?;
        optim.optimizer = optim
            .optimizer
            .load(&dir, device)
            .map_err(|e| anyhow::anyhow!("Failed to load optimizer from {}: {e}", dir.display()))?;
        let meta = read_meta(&dir)?;
        state.global_step = meta.global_step;
        start_epoch = meta.epoch + 1;
        tracing::info!(start_epoch, global_step = meta.global_step, "Resumed training from checkpoint");
    }

    if config.num_sanity_val_steps > 0 && start_epoch == 0 {
        state.sanity_checking = true;
        validate(policy, &model, data, &state, &mut NullSink, Some(config.num_sanity_val_steps))?;
        state.sanity_checking = false;
        tracing::debug!(batches = config.num_sanity_val_steps, "Sanity validation passed");
    }

    policy.on_train_start();
    let train_start = Instant::now();

    for epoch in start_epoch..max_epochs {
        state.current_epoch = epoch;
        let lrs = optim.lrs_at(epoch);
        let num_batches = data.num_training_batches();
        let pb = progress_bar(config.progress, num_batches, epoch);

        let mut seen = 0;
        for batch in data.train_batches(epoch) {
            seen += 1;
            let out = policy.training_step(&model, &batch, logger)?;
            let grads = out.loss().div_scalar(accumulate as f64).backward();
            optim.optimizer.accumulate(&model, grads);

            if seen % accumulate == 0 || seen == num_batches {
                model = optim.optimizer.step(model, &lrs);
                state.global_step += 1;
            }
            model = policy.on_train_batch_end(model, &state, logger)?;
            pb.inc(1);
        }
        if seen != num_batches {
            tracing::warn!(expected = num_batches, seen, epoch, "Epoch batch count differs from data module");
        }
        // a short epoch can leave a partial accumulation behind
        if optim.optimizer.has_pending() {
            model = optim.optimizer.step(model, &lrs);
            state.global_step += 1;
            model = policy.on_train_batch_end(model, &state, logger)?;
        }
        pb.finish_with_message(format!("epoch {epoch} done"));

        for (group, &lr) in optim.optimizer.groups().iter().zip(&lrs) {
            logger.log(&format!("lr_{}", group.group().name), lr, LogOptions::default());
        }
        // `lr` mirrors the backbone group
        if let Some(&lr) = lrs.first() {
            logger.log("lr", lr, LogOptions::default());
        }
        validate(policy, &model, data, &state, logger, None)?;
        logger.end_epoch(epoch);

        if config.checkpoint_interval > 0 && (epoch + 1) % config.checkpoint_interval == 0 {
            let meta = CheckpointMeta { epoch, global_step: state.global_step };
            save_checkpoint(&config.epoch_dir(epoch), &model, &optim.optimizer, &meta)?;
        }
    }

    tracing::info!(
        epochs = max_epochs.saturating_sub(start_epoch),
        global_step = state.global_step,
        elapsed_secs = format!("{:.1}", train_start.elapsed().as_secs_f64()),
        "Training loop finished"
    );

    let meta = CheckpointMeta { epoch: max_epochs.saturating_sub(1), global_step: state.global_step };
    save_checkpoint(&config.final_dir(), &model, &optim.optimizer, &meta)?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_paths() {
        let config = TrainerConfig::new().with_checkpoint_dir("/tmp/run".into());
        assert_eq!(config.epoch_dir(3), PathBuf::from("/tmp/run/epoch_3"));
        assert_eq!(config.final_dir(), PathBuf::from("/tmp/run/final"));
    }

    #[test]
    fn test_meta_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let meta = CheckpointMeta { epoch: 4, global_step: 120 };
        serde_json::to_writer(std::fs::File::create(dir.path().join("meta.json")).unwrap(), &meta).unwrap();
        assert_eq!(read_meta(dir.path()).unwrap(), meta);
    }

    #[test]
    fn test_missing_meta_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = read_meta(dir.path()).unwrap_err();
        assert!(err.to_string().contains("meta.json"), "got {err}");
    }
}
