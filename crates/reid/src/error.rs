/// Errors raised by the training core.
///
/// `Config`, `InsufficientIdentities` and `DegenerateBatch` are fatal for the
/// run; nothing in the core retries.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    /// Malformed or inconsistent experiment configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// The catalog cannot fill a single batch with distinct identities.
    #[error("Insufficient identities: catalog has {available}, batch needs {required}")]
    InsufficientIdentities { available: usize, required: usize },

    /// A metric term needs negatives but the batch holds fewer than 2 identities.
    #[error("Degenerate batch: {identities} identit(y/ies) in batch, triplet term needs at least 2")]
    DegenerateBatch { identities: usize },

    /// Tensor shapes or labels do not match each other.
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// Loss evaluated to NaN or infinity. `step` is filled in by the
    /// orchestrator; a bare loss computation leaves it `None`.
    #[error(
        "Numerical instability{}: loss = {value}",
        .step.map(|s| format!(" at step {s}")).unwrap_or_default()
    )]
    NumericalInstability { step: Option<usize>, value: f64 },

    /// Wall-clock budget for the run was exceeded.
    #[error("Run timed out after {elapsed_secs:.1}s")]
    TimedOut { elapsed_secs: f64 },

    /// Failure reported by an external collaborator (model, dataset, evaluator, exporter).
    #[error("Collaborator error: {0}")]
    Collaborator(#[source] anyhow::Error),
}

impl TrainError {
    /// Shorthand for building a [`TrainError::Config`].
    pub fn config(msg: impl Into<String>) -> Self {
        TrainError::Config(msg.into())
    }

    /// Attach the optimizer step to a `NumericalInstability`; other variants
    /// pass through unchanged.
    pub fn at_step(self, step: usize) -> Self {
        match self {
            TrainError::NumericalInstability { value, .. } => TrainError::NumericalInstability {
                step: Some(step),
                value,
            },
            other => other,
        }
    }
}
