//! Gradient checking utilities for validating the tape.
//!
//! Compares gradients from [`grad`](crate::grad()) against central finite
//! differences of the same function.
//!
//! # Example
//!
//! ```
//! use maml_autograd::gradcheck::{check_gradients, GradCheckConfig};
//! use scirs2_core::ndarray::array;
//!
//! let result = check_gradients(
//!     |_tape, vars| Ok(vars[0].mul(&vars[0])?.sum()),
//!     &[array![[1.0, -2.0]]],
//!     &GradCheckConfig::default(),
//! )
//! .unwrap();
//! assert!(result.passed);
//! ```

use crate::{grad, AutogradResult, GradOptions, Tape, Var};
use scirs2_core::ndarray::Array2;

/// Configuration for gradient checking.
#[derive(Debug, Clone)]
pub struct GradCheckConfig {
    /// Step for central differences.
    pub epsilon: f64,
    /// Relative tolerance.
    pub rel_tolerance: f64,
    /// Absolute tolerance.
    pub abs_tolerance: f64,
}

impl Default for GradCheckConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            rel_tolerance: 1e-4,
            abs_tolerance: 1e-6,
        }
    }
}

impl GradCheckConfig {
    /// Looser tolerances for long compositions (e.g. unrolled inner loops).
    pub fn relaxed() -> Self {
        Self {
            epsilon: 1e-5,
            rel_tolerance: 1e-3,
            abs_tolerance: 1e-5,
        }
    }
}

/// A single element whose analytic and numerical gradients disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientMismatch {
    /// Index of the input.
    pub input: usize,
    /// Element position within the input.
    pub position: (usize, usize),
    pub analytic: f64,
    pub numerical: f64,
}

/// Outcome of [`check_gradients`].
#[derive(Debug, Clone)]
pub struct GradCheckResult {
    /// Number of scalar elements compared.
    pub num_checked: usize,
    /// Largest absolute difference.
    pub max_abs_error: f64,
    /// Whether every element passed.
    pub passed: bool,
    pub mismatches: Vec<GradientMismatch>,
}

/// Central-difference gradient of `f` at `inputs`, evaluated on fresh tapes.
///
/// Inputs are recorded as leaves so functions that differentiate internally
/// (unrolled inner loops) see the same graph as in [`check_gradients`].
pub fn numerical_gradient<F>(
    f: &F,
    inputs: &[Array2<f64>],
    epsilon: f64,
) -> AutogradResult<Vec<Array2<f64>>>
where
    F: Fn(&Tape, &[Var]) -> AutogradResult<Var>,
{
    let evaluate = |values: &[Array2<f64>]| -> AutogradResult<f64> {
        let tape = Tape::new();
        let vars: Vec<Var> = values.iter().map(|v| tape.leaf(v.clone())).collect();
        f(&tape, &vars)?.scalar()
    };

    let mut gradients = Vec::with_capacity(inputs.len());
    for (index, input) in inputs.iter().enumerate() {
        let mut gradient = Array2::zeros(input.raw_dim());
        for ((row, col), slot) in gradient.indexed_iter_mut() {
            let mut shifted = inputs.to_vec();
            shifted[index][[row, col]] += epsilon;
            let plus = evaluate(&shifted)?;
            shifted[index][[row, col]] -= 2.0 * epsilon;
            let minus = evaluate(&shifted)?;
            *slot = (plus - minus) / (2.0 * epsilon);
        }
        gradients.push(gradient);
    }
    Ok(gradients)
}

/// Check the tape's gradients of `f` against finite differences.
///
/// `f` receives a tape and one leaf per input and must return a 1×1 output.
pub fn check_gradients<F>(
    f: F,
    inputs: &[Array2<f64>],
    config: &GradCheckConfig,
) -> AutogradResult<GradCheckResult>
where
    F: Fn(&Tape, &[Var]) -> AutogradResult<Var>,
{
    let tape = Tape::new();
    let leaves: Vec<Var> = inputs.iter().map(|v| tape.leaf(v.clone())).collect();
    let output = f(&tape, &leaves)?;
    let analytic = grad(&output, &leaves, GradOptions::detached())?;
    let numerical = numerical_gradient(&f, inputs, config.epsilon)?;

    let mut result = GradCheckResult {
        num_checked: 0,
        max_abs_error: 0.0,
        passed: true,
        mismatches: Vec::new(),
    };

    for (input, (a, n)) in analytic.iter().zip(&numerical).enumerate() {
        let a = a.value();
        for ((position, &analytic), &numerical) in a.indexed_iter().zip(n.iter()) {
            let abs_error = (analytic - numerical).abs();
            let scale = analytic.abs().max(numerical.abs());
            result.num_checked += 1;
            result.max_abs_error = result.max_abs_error.max(abs_error);
            if abs_error > config.abs_tolerance && abs_error > config.rel_tolerance * scale {
                result.passed = false;
                result.mismatches.push(GradientMismatch {
                    input,
                    position,
                    analytic,
                    numerical,
                });
            }
        }
    }

    Ok(result)
}
