use backbones::BackboneError;

/// Errors raised by the training core.
///
/// Configuration problems surface when the method or its optimizers are built;
/// shape and count problems surface at the step that detects them. None of them
/// is recovered from.
#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    #[error(transparent)]
    Backbone(#[from] BackboneError),

    #[error("{0} not in (sgd, adam, adamw)")]
    UnknownOptimizer(String),

    #[error("{0} not in (none, warmup_cosine, cosine, step)")]
    UnknownScheduler(String),

    #[error("LARS is only compatible with SGD, got optimizer '{0}'")]
    LarsRequiresSgd(String),

    #[error("the step scheduler needs at least one entry in lr_decay_steps")]
    MissingDecaySteps,

    #[error("expected {expected} crops per batch, got {got}")]
    CropCountMismatch { expected: usize, got: usize },

    #[error("online and momentum modules do not match: {0}")]
    MomentumStructure(String),

    #[error("tau schedule needs max_steps > 0")]
    ZeroMaxSteps,

    #[error("tau bounds must satisfy 0 <= base ({base}) <= final ({final_tau}) <= 1")]
    InvalidTau { base: f64, final_tau: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
