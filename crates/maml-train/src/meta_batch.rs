//! Deferred meta-batch accumulation.
//!
//! A meta-batch spans `n_task` episodes recorded on one tape. The persistent
//! parameters are bound once when the first episode starts; the tape is
//! dropped together with the session after the outer step.

use crate::config::MetaLossReduction;
use crate::parameter::{MetaLeaves, ParameterStore};
use crate::{MamlError, MamlResult};
use maml_autograd::{Tape, Var};

/// A tape with the persistent parameters bound on it.
#[derive(Debug, Clone)]
pub struct TapeSession {
    leaves: MetaLeaves,
}

impl TapeSession {
    /// Fresh tape with every parameter of `store` recorded as a leaf or constant.
    pub fn bind(store: &ParameterStore) -> Self {
        let tape = Tape::new();
        Self {
            leaves: store.bind(&tape),
        }
    }

    pub fn tape(&self) -> &Tape {
        self.leaves.tape()
    }

    pub fn leaves(&self) -> &MetaLeaves {
        &self.leaves
    }
}

/// Collects per-episode meta-losses until `n_task` are available.
#[derive(Debug)]
pub struct MetaBatchAccumulator {
    n_task: usize,
    reduction: MetaLossReduction,
    session: Option<TapeSession>,
    losses: Vec<Var>,
}

impl MetaBatchAccumulator {
    pub fn new(n_task: usize, reduction: MetaLossReduction) -> MamlResult<Self> {
        if n_task == 0 {
            return Err(MamlError::Config("n_task must be at least 1".to_string()));
        }
        Ok(Self {
            n_task,
            reduction,
            session: None,
            losses: Vec::with_capacity(n_task),
        })
    }

    /// The current meta-batch's session, binding `store` if none is open.
    pub fn session(&mut self, store: &ParameterStore) -> &TapeSession {
        self.session.get_or_insert_with(|| TapeSession::bind(store))
    }

    /// Add an episode's meta-loss; returns whether the meta-batch is full.
    pub fn push(&mut self, loss: Var) -> MamlResult<bool> {
        let session = self.session.as_ref().ok_or_else(|| {
            MamlError::Shape("Meta-loss pushed without an open session".to_string())
        })?;
        if !loss.tape().same_as(session.tape()) {
            return Err(MamlError::Shape(
                "Meta-loss was recorded on a different tape".to_string(),
            ));
        }
        if loss.shape() != (1, 1) {
            return Err(MamlError::Shape(format!(
                "Meta-loss must be 1x1, got {:?}",
                loss.shape()
            )));
        }
        self.losses.push(loss);
        Ok(self.is_ready())
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.losses.len() >= self.n_task
    }

    /// Combine the buffered losses in insertion order.
    pub fn reduce(&self) -> MamlResult<Var> {
        let (first, rest) = self
            .losses
            .split_first()
            .ok_or_else(|| MamlError::EmptyInput("meta-batch".to_string()))?;
        let mut total = first.clone();
        for loss in rest {
            total = total.add(loss)?;
        }
        Ok(match self.reduction {
            MetaLossReduction::Sum => total,
            MetaLossReduction::Mean => total.scale(1.0 / self.losses.len() as f64),
        })
    }

    /// Reduce, close the session and return it with the combined loss.
    pub fn take(&mut self) -> MamlResult<(TapeSession, Var)> {
        let combined = self.reduce()?;
        let session = self
            .session
            .take()
            .ok_or_else(|| MamlError::EmptyInput("meta-batch session".to_string()))?;
        self.losses.clear();
        Ok((session, combined))
    }

    /// Drop buffered losses and the session; returns how many losses were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.losses.len();
        self.losses.clear();
        self.session = None;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use scirs2_core::ndarray::array;

    fn store() -> ParameterStore {
        let mut store = ParameterStore::new();
        store.register("w", array![[1.0, 2.0]]).unwrap();
        store
    }

    #[test]
    fn test_sum_in_insertion_order() {
        let store = store();
        let mut acc = MetaBatchAccumulator::new(3, MetaLossReduction::Sum).unwrap();
        for value in [0.5, 1.5, 2.0] {
            let loss = acc.session(&store).tape().constant(array![[value]]);
            let ready = acc.push(loss).unwrap();
            assert_eq!(ready, value == 2.0);
        }
        let (_, total) = acc.take().unwrap();
        assert_abs_diff_eq!(total.scalar().unwrap(), 4.0, epsilon = 1e-12);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_mean_reduction() {
        let store = store();
        let mut acc = MetaBatchAccumulator::new(2, MetaLossReduction::Mean).unwrap();
        for value in [1.0, 3.0] {
            let loss = acc.session(&store).tape().constant(array![[value]]);
            acc.push(loss).unwrap();
        }
        assert_abs_diff_eq!(acc.reduce().unwrap().scalar().unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_session_shared_until_take() {
        let store = store();
        let mut acc = MetaBatchAccumulator::new(2, MetaLossReduction::Sum).unwrap();
        let first = acc.session(&store).tape().clone();
        let second = acc.session(&store).tape().clone();
        assert!(first.same_as(&second));

        acc.push(first.constant(array![[1.0]])).unwrap();
        acc.push(first.constant(array![[1.0]])).unwrap();
        acc.take().unwrap();
        assert!(!acc.session(&store).tape().same_as(&first));
    }

    #[test]
    fn test_rejects_foreign_tape() {
        let store = store();
        let mut acc = MetaBatchAccumulator::new(1, MetaLossReduction::Sum).unwrap();
        acc.session(&store);
        let stray = Tape::new().constant(array![[1.0]]);
        assert!(acc.push(stray).is_err());
    }

    #[test]
    fn test_discard_and_empty_reduce() {
        let store = store();
        let mut acc = MetaBatchAccumulator::new(4, MetaLossReduction::Sum).unwrap();
        let loss = acc.session(&store).tape().constant(array![[1.0]]);
        acc.push(loss).unwrap();
        assert_eq!(acc.discard(), 1);
        assert!(matches!(acc.reduce(), Err(MamlError::EmptyInput(_))));
        assert!(MetaBatchAccumulator::new(0, MetaLossReduction::Sum).is_err());
    }
}
