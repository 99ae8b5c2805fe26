//! Inner-loop adaptation on an episode's support set.

use crate::loss::Loss;
use crate::module::Adaptable;
use crate::parameter::{FastWeights, MetaLeaves, WeightView};
use crate::{MamlConfig, MamlError, MamlResult};
use maml_autograd::{grad, GradOptions, Var};
use tracing::debug;

/// Inner-loop hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InnerLoopConfig {
    /// Number of gradient steps (K).
    pub task_update_num: usize,
    /// Step size.
    pub train_lr: f64,
    /// Detach each inner gradient, dropping second-order terms.
    pub first_order: bool,
}

impl From<&MamlConfig> for InnerLoopConfig {
    fn from(config: &MamlConfig) -> Self {
        Self {
            task_update_num: config.task_update_num,
            train_lr: config.train_lr,
            first_order: config.first_order,
        }
    }
}

/// Result of adapting to one support set.
#[derive(Debug, Clone)]
pub struct Adaptation {
    /// Adapted weights of every trainable parameter.
    pub fast: FastWeights,
    /// Support loss before each of the K steps.
    pub support_losses: Vec<f64>,
}

/// Runs K differentiable SGD steps on fast weights.
#[derive(Debug, Clone, Copy)]
pub struct InnerLoopAdapter {
    config: InnerLoopConfig,
}

impl InnerLoopAdapter {
    pub fn new(config: InnerLoopConfig) -> MamlResult<Self> {
        if config.task_update_num == 0 {
            return Err(MamlError::Config(
                "task_update_num must be at least 1".to_string(),
            ));
        }
        if !config.train_lr.is_finite() || config.train_lr <= 0.0 {
            return Err(MamlError::Config(format!(
                "train_lr must be positive and finite, got {}",
                config.train_lr
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &InnerLoopConfig {
        &self.config
    }

    /// Adapt the trainable parameters bound in `leaves` to `support`.
    ///
    /// Fast weights start empty, so step 1 reads the persistent leaves. Each
    /// step records `w' = w - lr * dL/dw` as new tape nodes; unless
    /// `first_order` is set, `dL/dw` is itself recorded so the query loss can
    /// be differentiated through every step.
    pub fn adapt(
        &self,
        model: &dyn Adaptable,
        leaves: &MetaLeaves,
        support: &Var,
        labels: &[usize],
        loss_fn: &dyn Loss,
    ) -> MamlResult<Adaptation> {
        let options = if self.config.first_order {
            GradOptions::detached()
        } else {
            GradOptions::create_graph()
        };
        let trainable = leaves.trainable_ids();
        let mut fast = FastWeights::new();
        let mut support_losses = Vec::with_capacity(self.config.task_update_num);

        for step in 0..self.config.task_update_num {
            let view = WeightView::with_fast(leaves, &fast);
            let scores = model.forward(support, &view)?;
            let loss = loss_fn.compute(&scores, labels)?;
            let value = loss.scalar()?;
            if !value.is_finite() {
                return Err(MamlError::Numerical(format!(
                    "Support loss is {} at inner step {}",
                    value, step
                )));
            }
            support_losses.push(value);

            let current = trainable
                .iter()
                .map(|&id| view.resolve(id))
                .collect::<MamlResult<Vec<_>>>()?;
            let grads = grad(&loss, &current, options)?;

            let mut next = FastWeights::new();
            for ((&id, weight), g) in trainable.iter().zip(&current).zip(&grads) {
                if !g.with_value(|v| v.iter().all(|x| x.is_finite())) {
                    return Err(MamlError::Numerical(format!(
                        "Non-finite inner gradient for parameter {} at step {}",
                        id, step
                    )));
                }
                next.insert(id, weight.sub(&g.scale(self.config.train_lr))?);
            }
            fast = next;

            debug!(step, loss = value, "inner step");
        }

        Ok(Adaptation {
            fast,
            support_losses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::CrossEntropyLoss;
    use crate::module::MamlModel;
    use maml_autograd::Tape;
    use scirs2_core::ndarray::array;
    use scirs2_core::random::{SeedableRng, StdRng};

    fn separable() -> (scirs2_core::ndarray::Array2<f64>, Vec<usize>) {
        (
            array![[2.0, 0.1], [1.8, -0.2], [-2.1, 0.0], [-1.9, 0.3]],
            vec![0, 0, 1, 1],
        )
    }

    fn adapter(k: usize, lr: f64, first_order: bool) -> InnerLoopAdapter {
        InnerLoopAdapter::new(InnerLoopConfig {
            task_update_num: k,
            train_lr: lr,
            first_order,
        })
        .unwrap()
    }

    #[test]
    fn test_records_one_loss_per_step() {
        let model = MamlModel::linear(2, 2, &mut StdRng::seed_from_u64(0)).unwrap();
        let (x, y) = separable();
        for k in [1, 3, 7] {
            let tape = Tape::new();
            let leaves = model.parameters().bind(&tape);
            let support = tape.constant(x.clone());
            let adaptation = adapter(k, 0.1, false)
                .adapt(&model, &leaves, &support, &y, &CrossEntropyLoss)
                .unwrap();
            assert_eq!(adaptation.support_losses.len(), k);
            assert_eq!(adaptation.fast.len(), 2);
        }
    }

    #[test]
    fn test_support_loss_non_increasing_on_separable_task() {
        let model = MamlModel::linear(2, 2, &mut StdRng::seed_from_u64(4)).unwrap();
        let (x, y) = separable();
        let tape = Tape::new();
        let leaves = model.parameters().bind(&tape);
        let support = tape.constant(x);
        let losses = adapter(10, 0.1, true)
            .adapt(&model, &leaves, &support, &y, &CrossEntropyLoss)
            .unwrap()
            .support_losses;
        for pair in losses.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-12, "{:?}", losses);
        }
    }

    #[test]
    fn test_persistent_values_untouched() {
        let model = MamlModel::linear(2, 2, &mut StdRng::seed_from_u64(2)).unwrap();
        let before = model.parameters().state_dict();
        let (x, y) = separable();
        let tape = Tape::new();
        let leaves = model.parameters().bind(&tape);
        let support = tape.constant(x);
        let adaptation = adapter(3, 0.5, false)
            .adapt(&model, &leaves, &support, &y, &CrossEntropyLoss)
            .unwrap();
        assert_eq!(model.parameters().state_dict(), before);

        let w = model.classifier().weight();
        let adapted = adaptation.fast.get(w).unwrap().value();
        assert_ne!(&adapted, model.parameters().value(w).unwrap());
    }

    #[test]
    fn test_frozen_parameters_are_not_adapted() {
        let mut model = MamlModel::mlp(&[2, 3], 2, &mut StdRng::seed_from_u64(1)).unwrap();
        model.freeze_feature().unwrap();
        let (x, y) = separable();
        let tape = Tape::new();
        let leaves = model.parameters().bind(&tape);
        let support = tape.constant(x);
        let adaptation = adapter(2, 0.1, false)
            .adapt(&model, &leaves, &support, &y, &CrossEntropyLoss)
            .unwrap();
        let adapted: Vec<_> = adaptation.fast.iter().map(|(id, _)| id).collect();
        assert_eq!(adapted, model.classifier().parameter_ids());
    }

    #[test]
    fn test_first_order_fast_weights_are_shifted_copies() {
        let model = MamlModel::linear(2, 2, &mut StdRng::seed_from_u64(3)).unwrap();
        let w = model.classifier().weight();
        let (x, y) = separable();
        // d(sum of column 0 of w')/dw equals the column mask when the inner
        // gradient is detached
        let mask = array![[1.0, 0.0], [1.0, 0.0]];
        let meta_gradient = |first_order: bool| {
            let tape = Tape::new();
            let leaves = model.parameters().bind(&tape);
            let support = tape.constant(x.clone());
            let adaptation = adapter(2, 0.5, first_order)
                .adapt(&model, &leaves, &support, &y, &CrossEntropyLoss)
                .unwrap();
            let picked = adaptation
                .fast
                .get(w)
                .unwrap()
                .mul(&tape.constant(mask.clone()))
                .unwrap()
                .sum();
            let leaf = leaves.get(w).unwrap().clone();
            grad(&picked, &[leaf], GradOptions::detached()).unwrap()[0].value()
        };

        let first = meta_gradient(true);
        assert_eq!(first, mask);
        let second = meta_gradient(false);
        let gap = (&second - &mask).mapv(f64::abs).sum();
        assert!(gap > 1e-6, "second-order terms vanished");
    }

    #[test]
    fn test_rejects_zero_steps() {
        let config = InnerLoopConfig {
            task_update_num: 0,
            train_lr: 0.01,
            first_order: false,
        };
        assert!(matches!(
            InnerLoopAdapter::new(config),
            Err(MamlError::Config(_))
        ));
    }
}
