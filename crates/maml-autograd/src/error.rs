//! Error types for tape construction and differentiation.

use thiserror::Error;

/// Errors raised while recording operations or computing gradients.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutogradError {
    /// Operand shapes are incompatible for the requested operation.
    #[error("Shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: (usize, usize),
        rhs: (usize, usize),
    },

    /// Gradients can only be taken of a 1×1 output.
    #[error("Gradient output must be a 1x1 scalar, got {0:?}")]
    NonScalarOutput((usize, usize)),

    /// Two variables recorded on different tapes were combined.
    #[error("Variables belong to different tapes")]
    ForeignTape,

    /// A class label is out of range or the label count does not match the rows.
    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    /// An operation received an empty tensor.
    #[error("Empty input: {0}")]
    EmptyInput(String),
}

/// Result type for autograd operations.
pub type AutogradResult<T> = Result<T, AutogradError>;
