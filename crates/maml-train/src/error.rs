//! Error types for meta-training operations.

use maml_autograd::AutogradError;
use thiserror::Error;

/// Caller asked for an operating mode MAML does not support.
///
/// These indicate a bug in the calling code or its configuration and are
/// never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// Adaptation backpropagates through the feature path, so raw inputs are required.
    #[error("MAML does not support fixed (precomputed) features")]
    PrecomputedFeatures,

    /// The generic further-adaptation hook has no meaning here.
    #[error("MAML performs further adaptation simply by increasing task_update_num")]
    AdaptationHookUnsupported,

    /// The episode does not have the configured number of class groups.
    #[error("Episode has {found} class groups but n_way is {expected}")]
    WayMismatch { expected: usize, found: usize },
}

/// Errors that can occur during meta-training and evaluation.
#[derive(Error, Debug)]
pub enum MamlError {
    /// Unsupported operating mode.
    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    /// A loss or gradient became non-finite.
    #[error("Numerical failure: {0}")]
    Numerical(String),

    /// Episode or tensor shape is not what the operation needs.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Error in configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error in optimizer operation.
    #[error("Optimizer error: {0}")]
    Optimizer(String),

    /// Error in parameter save/load.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// An input collection was empty.
    #[error("Empty input: {0}")]
    EmptyInput(String),

    /// Error from the differentiation tape.
    #[error("Autograd error: {0}")]
    Autograd(#[from] AutogradError),

    /// I/O error while reading or writing configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MamlError {
    /// Whether this error is a [`UsageError`].
    pub fn is_usage(&self) -> bool {
        matches!(self, MamlError::Usage(_))
    }
}

/// Result type for meta-training operations.
pub type MamlResult<T> = Result<T, MamlError>;
