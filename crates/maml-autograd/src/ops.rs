//! Recorded operators.
//!
//! Every operator validates shapes, computes its value eagerly and appends a
//! node. The backward rules in [`crate::grad`] are written with these same
//! operators, which is what makes gradients differentiable.

use crate::tape::Op;
use crate::{AutogradError, AutogradResult, Var};
use scirs2_core::ndarray::{Array2, Axis};

fn binary_same_shape(op: &'static str, a: &Var, b: &Var) -> AutogradResult<()> {
    a.check_same_tape(b)?;
    if a.shape != b.shape {
        return Err(AutogradError::ShapeMismatch {
            op,
            lhs: a.shape,
            rhs: b.shape,
        });
    }
    Ok(())
}

/// Row-wise softmax, shifted by the row maximum.
pub(crate) fn softmax_rows(x: &Array2<f64>) -> Array2<f64> {
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// One-hot matrix for `labels` with `classes` columns.
pub fn one_hot(labels: &[usize], classes: usize) -> Array2<f64> {
    let mut out = Array2::zeros((labels.len(), classes));
    for (row, &label) in labels.iter().enumerate() {
        if label < classes {
            out[[row, label]] = 1.0;
        }
    }
    out
}

impl Var {
    fn unary(&self, value: Array2<f64>, op: Op) -> Var {
        let requires_grad = self.requires_grad();
        self.tape.push(value, op, requires_grad)
    }

    fn binary(&self, other: &Var, value: Array2<f64>, op: Op) -> Var {
        let requires_grad = self.requires_grad() || other.requires_grad();
        self.tape.push(value, op, requires_grad)
    }

    /// Elementwise `self + other`.
    pub fn add(&self, other: &Var) -> AutogradResult<Var> {
        binary_same_shape("add", self, other)?;
        let value = self.with_value(|a| other.with_value(|b| a + b));
        Ok(self.binary(other, value, Op::Add(self.id, other.id)))
    }

    /// Elementwise `self - other`.
    pub fn sub(&self, other: &Var) -> AutogradResult<Var> {
        binary_same_shape("sub", self, other)?;
        let value = self.with_value(|a| other.with_value(|b| a - b));
        Ok(self.binary(other, value, Op::Sub(self.id, other.id)))
    }

    /// Elementwise (Hadamard) product.
    pub fn mul(&self, other: &Var) -> AutogradResult<Var> {
        binary_same_shape("mul", self, other)?;
        let value = self.with_value(|a| other.with_value(|b| a * b));
        Ok(self.binary(other, value, Op::Mul(self.id, other.id)))
    }

    /// `factor * self`.
    pub fn scale(&self, factor: f64) -> Var {
        let value = self.with_value(|a| a * factor);
        self.unary(value, Op::Scale(self.id, factor))
    }

    /// Matrix product `self @ other`.
    pub fn matmul(&self, other: &Var) -> AutogradResult<Var> {
        self.check_same_tape(other)?;
        if self.shape.1 != other.shape.0 {
            return Err(AutogradError::ShapeMismatch {
                op: "matmul",
                lhs: self.shape,
                rhs: other.shape,
            });
        }
        let value = self.with_value(|a| other.with_value(|b| a.dot(b)));
        Ok(self.binary(other, value, Op::MatMul(self.id, other.id)))
    }

    /// Matrix transpose.
    pub fn transpose(&self) -> Var {
        let value = self.with_value(|a| a.t().to_owned());
        self.unary(value, Op::Transpose(self.id))
    }

    /// Elementwise `max(x, 0)`.
    pub fn relu(&self) -> Var {
        let value = self.with_value(|a| a.mapv(|v| v.max(0.0)));
        self.unary(value, Op::Relu(self.id))
    }

    /// Sum over rows: `m×n -> 1×n`.
    pub fn sum_rows(&self) -> Var {
        let value = self.with_value(|a| a.sum_axis(Axis(0)).insert_axis(Axis(0)));
        self.unary(value, Op::SumRows(self.id))
    }

    /// Sum over columns: `m×n -> m×1`.
    pub fn sum_cols(&self) -> Var {
        let value = self.with_value(|a| a.sum_axis(Axis(1)).insert_axis(Axis(1)));
        self.unary(value, Op::SumCols(self.id))
    }

    /// Sum of every element: `m×n -> 1×1`.
    pub fn sum(&self) -> Var {
        self.sum_rows().sum_cols()
    }

    /// Repeat a `1×n` row `rows` times.
    pub fn broadcast_rows(&self, rows: usize) -> AutogradResult<Var> {
        if self.shape.0 != 1 {
            return Err(AutogradError::ShapeMismatch {
                op: "broadcast_rows",
                lhs: self.shape,
                rhs: (rows, self.shape.1),
            });
        }
        let value = self.with_value(|a| {
            Array2::from_shape_fn((rows, a.ncols()), |(_, j)| a[[0, j]])
        });
        Ok(self.unary(value, Op::BroadcastRows(self.id, rows)))
    }

    /// Repeat an `m×1` column `cols` times.
    pub fn broadcast_cols(&self, cols: usize) -> AutogradResult<Var> {
        if self.shape.1 != 1 {
            return Err(AutogradError::ShapeMismatch {
                op: "broadcast_cols",
                lhs: self.shape,
                rhs: (self.shape.0, cols),
            });
        }
        let value = self.with_value(|a| {
            Array2::from_shape_fn((a.nrows(), cols), |(i, _)| a[[i, 0]])
        });
        Ok(self.unary(value, Op::BroadcastCols(self.id, cols)))
    }

    /// Add a `1×n` row to every row of `self`.
    pub fn add_row(&self, row: &Var) -> AutogradResult<Var> {
        self.check_same_tape(row)?;
        if row.shape.0 != 1 || row.shape.1 != self.shape.1 {
            return Err(AutogradError::ShapeMismatch {
                op: "add_row",
                lhs: self.shape,
                rhs: row.shape,
            });
        }
        let value = self.with_value(|a| row.with_value(|b| a + b));
        Ok(self.binary(row, value, Op::AddRow(self.id, row.id)))
    }

    /// Row-wise softmax.
    pub fn softmax(&self) -> Var {
        let value = self.with_value(softmax_rows);
        self.unary(value, Op::Softmax(self.id))
    }

    /// Mean cross-entropy of row-wise logits against class `labels` (1×1).
    pub fn cross_entropy(&self, labels: &[usize]) -> AutogradResult<Var> {
        let (rows, cols) = self.shape;
        if rows == 0 || cols == 0 {
            return Err(AutogradError::EmptyInput("cross_entropy logits".to_string()));
        }
        if labels.len() != rows {
            return Err(AutogradError::InvalidLabel(format!(
                "{} labels for {} rows",
                labels.len(),
                rows
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= cols) {
            return Err(AutogradError::InvalidLabel(format!(
                "label {} out of range for {} classes",
                bad, cols
            )));
        }

        let loss = self.with_value(|logits| {
            let mut total = 0.0;
            for (row, &label) in logits.rows().into_iter().zip(labels) {
                let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let log_sum_exp = row.iter().map(|v| (v - max).exp()).sum::<f64>().ln() + max;
                total += log_sum_exp - row[label];
            }
            total / rows as f64
        });

        let value = Array2::from_elem((1, 1), loss);
        Ok(self.unary(value, Op::CrossEntropy(self.id, labels.to_vec())))
    }
}

#[cfg(test)]
mod tests {
    use crate::Tape;
    use approx::assert_abs_diff_eq;
    use scirs2_core::ndarray::array;

    #[test]
    fn test_matmul_and_add_row() {
        let tape = Tape::new();
        let x = tape.constant(array![[1.0, 2.0], [3.0, 4.0]]);
        let w = tape.leaf(array![[1.0, 0.0, 1.0], [0.0, 1.0, 1.0]]);
        let b = tape.leaf(array![[0.5, -0.5, 0.0]]);
        let y = x.matmul(&w).unwrap().add_row(&b).unwrap();
        assert_eq!(y.shape(), (2, 3));
        assert_eq!(y.value(), array![[1.5, 1.5, 3.0], [3.5, 3.5, 7.0]]);
        assert!(y.requires_grad());
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let tape = Tape::new();
        let a = tape.leaf(array![[1.0, 2.0]]);
        let b = tape.leaf(array![[1.0, 2.0, 3.0]]);
        assert!(a.add(&b).is_err());
        assert!(a.matmul(&b).is_err());
        assert!(a.add_row(&b).is_err());
    }

    #[test]
    fn test_foreign_tape_rejected() {
        let a = Tape::new().leaf(array![[1.0]]);
        let b = Tape::new().leaf(array![[1.0]]);
        assert!(a.add(&b).is_err());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let tape = Tape::new();
        let s = tape.constant(array![[1.0, 2.0, 3.0], [1000.0, 1000.0, 1000.0]]).softmax();
        for row in s.value().rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let tape = Tape::new();
        let logits = tape.leaf(array![[0.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]]);
        let loss = logits.cross_entropy(&[0, 3]).unwrap();
        assert_abs_diff_eq!(loss.scalar().unwrap(), 4.0_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_cross_entropy_rejects_bad_labels() {
        let tape = Tape::new();
        let logits = tape.leaf(array![[0.0, 0.0]]);
        assert!(logits.cross_entropy(&[2]).is_err());
        assert!(logits.cross_entropy(&[0, 1]).is_err());
    }

    #[test]
    fn test_broadcasts() {
        let tape = Tape::new();
        let row = tape.constant(array![[1.0, 2.0]]);
        assert_eq!(row.broadcast_rows(3).unwrap().shape(), (3, 2));
        let col = tape.constant(array![[1.0], [2.0]]);
        assert_eq!(col.broadcast_cols(4).unwrap().value()[[1, 3]], 2.0);
        assert!(row.broadcast_cols(2).is_err());
    }
}
