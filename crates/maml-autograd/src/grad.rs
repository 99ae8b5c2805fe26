//! Reverse-mode differentiation over a [`Tape`].
//!
//! Vector-Jacobian products are built from the recorded operators in
//! [`crate::ops`], so with `create_graph` the returned gradients are ordinary
//! tape nodes that depend on the forward values and can be differentiated
//! again. Without it, every operand entering a product is detached first and
//! the results are constants.

use crate::tape::{NodeId, Op};
use crate::{one_hot, AutogradError, AutogradResult, Tape, Var};
use scirs2_core::ndarray::Array2;

/// Options for [`grad`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GradOptions {
    /// Record the backward pass so its results stay differentiable.
    pub create_graph: bool,
}

impl GradOptions {
    /// Differentiable gradients (second order available).
    pub fn create_graph() -> Self {
        Self { create_graph: true }
    }

    /// Detached gradients (first order only).
    pub fn detached() -> Self {
        Self {
            create_graph: false,
        }
    }
}

/// Gradients of the 1×1 `output` with respect to each of `wrt`.
///
/// `wrt` entries may be leaves or intermediate nodes. An entry the output does
/// not depend on receives a zero constant of the matching shape.
pub fn grad(output: &Var, wrt: &[Var], options: GradOptions) -> AutogradResult<Vec<Var>> {
    if output.shape() != (1, 1) {
        return Err(AutogradError::NonScalarOutput(output.shape()));
    }
    for var in wrt {
        output.check_same_tape(var)?;
    }

    let tape = output.tape().clone();
    let zeros = |var: &Var| tape.constant(Array2::zeros(var.shape()));

    let targets: Vec<NodeId> = wrt
        .iter()
        .map(Var::id)
        .filter(|&id| id <= output.id())
        .collect();
    let Some(&lowest) = targets.iter().min() else {
        return Ok(wrt.iter().map(zeros).collect());
    };

    let span = output.id() - lowest + 1;
    let relevant = relevance(&tape, lowest, output.id(), &targets);
    if !relevant[span - 1] {
        return Ok(wrt.iter().map(zeros).collect());
    }

    let mut grads: Vec<Option<Var>> = vec![None; span];
    grads[span - 1] = Some(tape.constant(Array2::ones((1, 1))));

    let backward = Backward {
        tape: &tape,
        create_graph: options.create_graph,
    };

    for id in (lowest..=output.id()).rev() {
        let slot = id - lowest;
        let Some(upstream) = grads[slot].clone() else {
            continue;
        };
        let op = tape.op_of(id);
        for (input, contribution) in backward.vjp(id, &op, &upstream)? {
            if input < lowest || !relevant[input - lowest] {
                continue;
            }
            let entry = &mut grads[input - lowest];
            *entry = Some(match entry.take() {
                Some(existing) => existing.add(&contribution)?,
                None => contribution,
            });
        }
    }

    Ok(wrt
        .iter()
        .map(|var| {
            var.id()
                .checked_sub(lowest)
                .and_then(|slot| grads.get(slot).cloned().flatten())
                .unwrap_or_else(|| zeros(var))
        })
        .collect())
}

/// Marks nodes in `lowest..=highest` that depend on a target and require grad.
fn relevance(tape: &Tape, lowest: NodeId, highest: NodeId, targets: &[NodeId]) -> Vec<bool> {
    let mut relevant = vec![false; highest - lowest + 1];
    for id in lowest..=highest {
        if !tape.requires_grad_of(id) && !targets.contains(&id) {
            continue;
        }
        relevant[id - lowest] = targets.contains(&id)
            || tape
                .op_of(id)
                .inputs()
                .iter()
                .any(|&input| input >= lowest && relevant[input - lowest]);
    }
    relevant
}

struct Backward<'a> {
    tape: &'a Tape,
    create_graph: bool,
}

impl Backward<'_> {
    /// Forward node as an operand of a backward product.
    fn operand(&self, id: NodeId) -> Var {
        let var = self.tape.var(id);
        if self.create_graph {
            var
        } else {
            var.detach()
        }
    }

    fn vjp(&self, id: NodeId, op: &Op, g: &Var) -> AutogradResult<Vec<(NodeId, Var)>> {
        let out = match op {
            Op::Leaf => Vec::new(),
            Op::Add(a, b) => vec![(*a, g.clone()), (*b, g.clone())],
            Op::Sub(a, b) => vec![(*a, g.clone()), (*b, g.scale(-1.0))],
            Op::Mul(a, b) => vec![
                (*a, g.mul(&self.operand(*b))?),
                (*b, g.mul(&self.operand(*a))?),
            ],
            Op::Scale(a, factor) => vec![(*a, g.scale(*factor))],
            Op::MatMul(a, b) => {
                let a_t = self.operand(*a).transpose();
                let b_t = self.operand(*b).transpose();
                vec![(*a, g.matmul(&b_t)?), (*b, a_t.matmul(g)?)]
            }
            Op::Transpose(a) => vec![(*a, g.transpose())],
            Op::Relu(a) => {
                // relu'' is zero almost everywhere, so the mask is a constant
                let mask = self
                    .tape
                    .value_of(*a)
                    .mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
                vec![(*a, g.mul(&self.tape.constant(mask))?)]
            }
            Op::SumRows(a) => {
                let rows = self.tape.value_of(*a).nrows();
                vec![(*a, g.broadcast_rows(rows)?)]
            }
            Op::SumCols(a) => {
                let cols = self.tape.value_of(*a).ncols();
                vec![(*a, g.broadcast_cols(cols)?)]
            }
            Op::BroadcastRows(a, _) => vec![(*a, g.sum_rows())],
            Op::BroadcastCols(a, _) => vec![(*a, g.sum_cols())],
            Op::AddRow(a, b) => vec![(*a, g.clone()), (*b, g.sum_rows())],
            Op::Softmax(a) => {
                // ds = s * (g - rowsum(g * s))
                let s = self.operand(id);
                let gs = g.mul(&s)?;
                let cols = s.shape().1;
                let correction = s.mul(&gs.sum_cols().broadcast_cols(cols)?)?;
                vec![(*a, gs.sub(&correction)?)]
            }
            Op::CrossEntropy(a, labels) => {
                // d/dlogits = (softmax(logits) - onehot) * g / rows
                let logits = self.operand(*a);
                let (rows, cols) = logits.shape();
                let probs = logits.softmax();
                let target = self.tape.constant(one_hot(labels, cols));
                let upstream = g.broadcast_cols(cols)?.broadcast_rows(rows)?;
                let diff = probs.sub(&target)?.mul(&upstream)?;
                vec![(*a, diff.scale(1.0 / rows as f64))]
            }
        };
        Ok(out)
    }
}
