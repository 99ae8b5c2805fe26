//! Append-only node arena shared by every [`Var`] recorded on it.
//!
//! Nodes are numbered in creation order, which is also a valid topological
//! order: an operation can only reference nodes that already exist. Backward
//! passes rely on this and sweep ids in descending order.

use crate::{AutogradError, AutogradResult};
use scirs2_core::ndarray::Array2;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Index of a node on its tape.
pub type NodeId = usize;

/// Operation that produced a node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Op {
    Leaf,
    Add(NodeId, NodeId),
    Sub(NodeId, NodeId),
    Mul(NodeId, NodeId),
    Scale(NodeId, f64),
    MatMul(NodeId, NodeId),
    Transpose(NodeId),
    Relu(NodeId),
    /// Column sums: `m×n -> 1×n`.
    SumRows(NodeId),
    /// Row sums: `m×n -> m×1`.
    SumCols(NodeId),
    /// `1×n -> rows×n`.
    BroadcastRows(NodeId, usize),
    /// `m×1 -> m×cols`.
    BroadcastCols(NodeId, usize),
    /// `m×n + 1×n`.
    AddRow(NodeId, NodeId),
    Softmax(NodeId),
    CrossEntropy(NodeId, Vec<usize>),
}

impl Op {
    /// Input node ids, in operand order.
    pub(crate) fn inputs(&self) -> Vec<NodeId> {
        match self {
            Op::Leaf => Vec::new(),
            Op::Add(a, b) | Op::Sub(a, b) | Op::Mul(a, b) | Op::MatMul(a, b) | Op::AddRow(a, b) => {
                vec![*a, *b]
            }
            Op::Scale(a, _)
            | Op::Transpose(a)
            | Op::Relu(a)
            | Op::SumRows(a)
            | Op::SumCols(a)
            | Op::BroadcastRows(a, _)
            | Op::BroadcastCols(a, _)
            | Op::Softmax(a)
            | Op::CrossEntropy(a, _) => vec![*a],
        }
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) value: Rc<Array2<f64>>,
    pub(crate) op: Op,
    pub(crate) requires_grad: bool,
}

#[derive(Debug, Default)]
pub(crate) struct TapeInner {
    pub(crate) nodes: Vec<Node>,
}

/// Handle to a computation tape.
///
/// Cloning a `Tape` is cheap and yields another handle to the same arena.
/// The arena lives until the last handle (including every [`Var`]) is dropped.
#[derive(Clone, Default)]
pub struct Tape {
    pub(crate) inner: Rc<RefCell<TapeInner>>,
}

impl Tape {
    /// Create an empty tape.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a differentiable leaf.
    pub fn leaf(&self, value: Array2<f64>) -> Var {
        self.push(value, Op::Leaf, true)
    }

    /// Record a leaf that never receives gradients.
    pub fn constant(&self, value: Array2<f64>) -> Var {
        self.push(value, Op::Leaf, false)
    }

    /// Number of recorded nodes.
    pub fn len(&self) -> usize {
        self.inner.borrow().nodes.len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two handles point at the same arena.
    pub fn same_as(&self, other: &Tape) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn push(&self, value: Array2<f64>, op: Op, requires_grad: bool) -> Var {
        let shape = value.dim();
        let mut inner = self.inner.borrow_mut();
        let id = inner.nodes.len();
        inner.nodes.push(Node {
            value: Rc::new(value),
            op,
            requires_grad,
        });
        Var {
            tape: self.clone(),
            id,
            shape,
        }
    }

    pub(crate) fn value_of(&self, id: NodeId) -> Rc<Array2<f64>> {
        Rc::clone(&self.inner.borrow().nodes[id].value)
    }

    pub(crate) fn op_of(&self, id: NodeId) -> Op {
        self.inner.borrow().nodes[id].op.clone()
    }

    pub(crate) fn requires_grad_of(&self, id: NodeId) -> bool {
        self.inner.borrow().nodes[id].requires_grad
    }

    /// Handle to an existing node.
    pub(crate) fn var(&self, id: NodeId) -> Var {
        let shape = self.inner.borrow().nodes[id].value.dim();
        Var {
            tape: self.clone(),
            id,
            shape,
        }
    }
}

impl fmt::Debug for Tape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tape").field("nodes", &self.len()).finish()
    }
}

/// A recorded 2-D value on a [`Tape`].
#[derive(Clone)]
pub struct Var {
    pub(crate) tape: Tape,
    pub(crate) id: NodeId,
    pub(crate) shape: (usize, usize),
}

impl Var {
    /// Node id on the owning tape.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// The owning tape.
    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    /// Copy of the recorded value.
    pub fn value(&self) -> Array2<f64> {
        self.tape.value_of(self.id).as_ref().clone()
    }

    /// Apply `f` to the recorded value without copying it.
    pub fn with_value<R>(&self, f: impl FnOnce(&Array2<f64>) -> R) -> R {
        let value = self.tape.value_of(self.id);
        f(&value)
    }

    /// The single element of a 1×1 value.
    pub fn scalar(&self) -> AutogradResult<f64> {
        if self.shape != (1, 1) {
            return Err(AutogradError::NonScalarOutput(self.shape));
        }
        Ok(self.with_value(|v| v[[0, 0]]))
    }

    /// Whether gradients can flow into this node.
    pub fn requires_grad(&self) -> bool {
        self.tape.requires_grad_of(self.id)
    }

    /// Whether this node is a leaf (created by [`Tape::leaf`] or [`Tape::constant`]).
    pub fn is_leaf(&self) -> bool {
        self.tape.op_of(self.id) == Op::Leaf
    }

    /// A constant leaf holding the same value, cut off from the graph.
    pub fn detach(&self) -> Var {
        self.tape.constant(self.value())
    }

    pub(crate) fn check_same_tape(&self, other: &Var) -> AutogradResult<()> {
        if self.tape.same_as(&other.tape) {
            Ok(())
        } else {
            Err(AutogradError::ForeignTape)
        }
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scirs2_core::ndarray::array;

    #[test]
    fn test_ids_follow_creation_order() {
        let tape = Tape::new();
        let a = tape.leaf(array![[1.0]]);
        let b = tape.constant(array![[2.0]]);
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);
        assert_eq!(tape.len(), 2);
        assert!(a.requires_grad());
        assert!(!b.requires_grad());
    }

    #[test]
    fn test_detach_creates_constant() {
        let tape = Tape::new();
        let a = tape.leaf(array![[1.0, 2.0]]);
        let d = a.detach();
        assert_ne!(a.id(), d.id());
        assert!(!d.requires_grad());
        assert!(d.is_leaf());
        assert_eq!(d.value(), a.value());
    }

    #[test]
    fn test_scalar_requires_1x1() {
        let tape = Tape::new();
        assert_eq!(tape.leaf(array![[3.5]]).scalar().unwrap(), 3.5);
        assert!(tape.leaf(array![[1.0, 2.0]]).scalar().is_err());
    }

    #[test]
    fn test_clone_shares_arena() {
        let tape = Tape::new();
        let other = tape.clone();
        other.constant(array![[0.0]]);
        assert_eq!(tape.len(), 1);
        assert!(tape.same_as(&other));
        assert!(!tape.same_as(&Tape::new()));
    }
}
