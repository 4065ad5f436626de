//! Metric sink seam and an epoch-aggregating implementation.

use std::collections::{BTreeMap, BTreeSet};

/// How a logged value is aggregated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Average over the epoch instead of keeping the latest value.
    pub on_epoch: bool,
    /// The value must be averaged across processes before it is reported.
    pub sync_dist: bool,
}

impl LogOptions {
    /// Epoch-aggregated and synced, the default for training statistics.
    pub const EPOCH_SYNCED: LogOptions = LogOptions { on_epoch: true, sync_dist: true };
    pub const SYNCED: LogOptions = LogOptions { on_epoch: false, sync_dist: true };
}

/// Destination for scalar metrics.
pub trait MetricSink {
    fn log(&mut self, name: &str, value: f64, options: LogOptions);

    fn log_dict(&mut self, metrics: &[(&str, f64)], options: LogOptions) {
        for &(name, value) in metrics {
            self.log(name, value, options);
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricSink for NullSink {
    fn log(&mut self, _name: &str, _value: f64, _options: LogOptions) {}
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Mean { sum: f64, count: usize },
    Last(f64),
}

impl Slot {
    fn value(&self) -> f64 {
        match *self {
            Slot::Mean { sum, count } => sum / count.max(1) as f64,
            Slot::Last(v) => v,
        }
    }
}

/// One epoch's reduced metrics.
pub type EpochMetrics = BTreeMap<String, f64>;

/// Reduced metrics of every finished epoch.
#[derive(Debug, Default, Clone)]
pub struct MetricsHistory {
    epochs: Vec<(usize, EpochMetrics)>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, epoch: usize, metrics: EpochMetrics) {
        self.epochs.push((epoch, metrics));
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last().map(|(_, m)| m)
    }

    /// Value of `name` at every epoch that logged it.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.epochs
            .iter()
            .filter_map(|(epoch, m)| m.get(name).map(|&v| (*epoch, v)))
            .collect()
    }
}

/// Aggregates `on_epoch` metrics with a running mean and emits one summary
/// event per epoch.
#[derive(Debug, Default)]
pub struct EpochMetricLogger {
    current: BTreeMap<String, Slot>,
    synced: BTreeSet<String>,
    history: MetricsHistory,
}

impl EpochMetricLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `name` in the open epoch.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.current.get(name).map(Slot::value)
    }

    /// Whether `name` was ever logged with `sync_dist`.
    pub fn requires_sync(&self, name: &str) -> bool {
        self.synced.contains(name)
    }

    pub fn history(&self) -> &MetricsHistory {
        &self.history
    }

    /// Close the epoch: reduce, emit, record in the history.
    pub fn end_epoch(&mut self, epoch: usize) -> EpochMetrics {
        let metrics: EpochMetrics = std::mem::take(&mut self.current)
            .into_iter()
            .map(|(name, slot)| (name, slot.value()))
            .collect();
        if !metrics.is_empty() {
            let summary = metrics
                .iter()
                .map(|(name, value)| format!("{name}={value:.4}"))
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!(epoch, "{summary}");
        }
        self.history.push(epoch, metrics.clone());
        metrics
    }
}

impl MetricSink for EpochMetricLogger {
    fn log(&mut self, name: &str, value: f64, options: LogOptions) {
        if options.sync_dist {
            self.synced.insert(name.to_string());
        }
        let slot = self.current.entry(name.to_string()).or_insert(if options.on_epoch {
            Slot::Mean { sum: 0.0, count: 0 }
        } else {
            Slot::Last(value)
        });
        match slot {
            Slot::Mean { sum, count } if options.on_epoch => {
                *sum += value;
                *count += 1;
            }
            other => *other = Slot::Last(value),
        }
        tracing::debug!(metric = name, value, "logged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_mean() {
        let mut logger = EpochMetricLogger::new();
        logger.log("train_acc1", 50.0, LogOptions::EPOCH_SYNCED);
        logger.log("train_acc1", 70.0, LogOptions::EPOCH_SYNCED);
        assert_eq!(logger.get("train_acc1"), Some(60.0));
        assert!(logger.requires_sync("train_acc1"));
    }

    #[test]
    fn test_step_value_keeps_latest() {
        let mut logger = EpochMetricLogger::new();
        logger.log("tau", 0.99, LogOptions::default());
        logger.log("tau", 0.995, LogOptions::default());
        assert_eq!(logger.get("tau"), Some(0.995));
        assert!(!logger.requires_sync("tau"));
    }

    #[test]
    fn test_end_epoch_resets_and_records() {
        let mut logger = EpochMetricLogger::new();
        logger.log_dict(&[("val_loss", 1.5), ("val_acc1", 40.0)], LogOptions::SYNCED);
        let metrics = logger.end_epoch(0);
        assert_eq!(metrics.get("val_loss"), Some(&1.5));
        assert_eq!(logger.get("val_loss"), None);

        logger.log("val_loss", 1.0, LogOptions::SYNCED);
        logger.end_epoch(1);
        assert_eq!(logger.history().series("val_loss"), vec![(0, 1.5), (1, 1.0)]);
        assert_eq!(logger.history().len(), 2);
    }
}
