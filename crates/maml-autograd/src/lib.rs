//! Reverse-mode automatic differentiation with higher-order gradients.
//!
//! A small tape-based engine over 2-D `f64` arrays. Every value produced by an
//! operation is recorded on a [`Tape`]; [`grad`] walks the tape backwards and
//! returns gradients as new tape nodes. With [`GradOptions::create_graph`] the
//! backward pass is itself recorded, so a gradient can be differentiated again.
//! That is what second-order meta-learning needs: the adapted weights of an
//! inner loop are functions of the initial weights, and the meta-gradient
//! flows through every inner gradient step.
//!
//! ```
//! use maml_autograd::{grad, GradOptions, Tape};
//! use scirs2_core::ndarray::array;
//!
//! let tape = Tape::new();
//! let w = tape.leaf(array![[1.5]]);
//! let loss = w.mul(&w).unwrap().sum();
//!
//! // one differentiable SGD step: w' = w - 0.1 * dL/dw
//! let g = grad(&loss, &[w.clone()], GradOptions::create_graph()).unwrap();
//! let adapted = w.sub(&g[0].scale(0.1)).unwrap();
//!
//! // d(w'^2)/dw = 2 w' * (1 - 0.2) = 2 * 1.2 * 0.8
//! let outer = adapted.mul(&adapted).unwrap().sum();
//! let meta = grad(&outer, &[w], GradOptions::detached()).unwrap();
//! assert!((meta[0].scalar().unwrap() - 1.92).abs() < 1e-12);
//! ```

mod error;
mod grad;
mod ops;
mod tape;

pub mod gradcheck;

pub use error::{AutogradError, AutogradResult};
pub use grad::{grad, GradOptions};
pub use ops::one_hot;
pub use tape::{NodeId, Tape, Var};
