//! Self-supervised training core.
//!
//! [`BaseMethod`] owns backbone construction, multi-crop batching, optimizer and
//! scheduler construction, and the online linear / k-NN evaluation every method
//! shares. [`MomentumMethod`] adds an EMA teacher: a second backbone whose weights
//! follow the online backbone through [`momentum::MomentumUpdater`]. Both plug
//! into the host loop in [`trainer`] through the [`policy::TrainingPolicy`] trait.

pub mod base;
pub mod batch;
pub mod bridge;
pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod logging;
pub mod loss;
pub mod momentum;
pub mod momentum_method;
pub mod optim;
pub mod policy;
pub mod trainer;

pub use base::{BaseMethod, BaseModel};
pub use batch::{Crops, TrainBatch, ValBatch};
pub use config::{ExtraOptimizerArgs, MethodConfig, MomentumMethodConfig};
pub use data::{SyntheticDataConfig, SyntheticDataModule};
pub use error::MethodError;
pub use logging::{EpochMetricLogger, LogOptions, MetricSink};
pub use momentum::{MomentumPairs, MomentumUpdater};
pub use momentum_method::{MomentumMethod, MomentumModel};
pub use policy::{DataModule, TrainerState, TrainingPolicy};
pub use trainer::{fit, load_checkpoint, TrainerConfig};
