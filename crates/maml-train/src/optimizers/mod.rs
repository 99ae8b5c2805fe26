//! Outer-loop optimizers for the persistent parameters.
//!
//! # Available Optimizers
//! - [`SgdOptimizer`]: Stochastic Gradient Descent with momentum
//! - [`AdamOptimizer`]: Adaptive Moment Estimation
//!
//! # Common Types
//! - [`Optimizer`]: Core trait that all optimizers implement
//! - [`OptimizerConfig`]: Configuration for optimizer parameters
//! - [`GradClipMode`]: Gradient clipping modes (by value or by norm)

pub mod adam;
pub mod common;
pub mod sgd;

pub use common::{GradClipMode, Optimizer, OptimizerConfig};

pub use adam::AdamOptimizer;
pub use sgd::SgdOptimizer;
