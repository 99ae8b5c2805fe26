//! Episode losses recorded on the tape.

use crate::{MamlError, MamlResult};
use maml_autograd::Var;
use std::fmt::Debug;

/// A differentiable loss over class scores.
pub trait Loss: Debug {
    /// Loss of `scores` (one row per example) against class `labels`, as a 1×1 node.
    fn compute(&self, scores: &Var, labels: &[usize]) -> MamlResult<Var>;

    /// Get the name of the loss function.
    fn name(&self) -> &str {
        "unknown"
    }
}

/// Mean softmax cross-entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl Loss for CrossEntropyLoss {
    fn compute(&self, scores: &Var, labels: &[usize]) -> MamlResult<Var> {
        if scores.shape().0 != labels.len() {
            return Err(MamlError::Shape(format!(
                "Shape mismatch: {} score rows vs {} labels",
                scores.shape().0,
                labels.len()
            )));
        }
        Ok(scores.cross_entropy(labels)?)
    }

    fn name(&self) -> &str {
        "cross_entropy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use maml_autograd::Tape;
    use scirs2_core::ndarray::array;

    #[test]
    fn test_cross_entropy_confident_prediction() {
        let tape = Tape::new();
        let scores = tape.constant(array![[10.0, 0.0], [0.0, 10.0]]);
        let loss = CrossEntropyLoss.compute(&scores, &[0, 1]).unwrap();
        assert!(loss.scalar().unwrap() < 1e-4);
    }

    #[test]
    fn test_cross_entropy_uniform_scores() {
        let tape = Tape::new();
        let scores = tape.constant(array![[0.0, 0.0, 0.0]]);
        let loss = CrossEntropyLoss.compute(&scores, &[2]).unwrap();
        assert_abs_diff_eq!(loss.scalar().unwrap(), 3.0_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_label_count_mismatch() {
        let tape = Tape::new();
        let scores = tape.constant(array![[0.0, 0.0]]);
        assert!(matches!(
            CrossEntropyLoss.compute(&scores, &[0, 1]),
            Err(MamlError::Shape(_))
        ));
    }
}
