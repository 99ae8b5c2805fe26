//! SGD optimizer with momentum.

use super::common::{
    export_buffers, gradient_for, import_buffers, prepare_gradients, Optimizer, OptimizerConfig,
};
use crate::parameter::{Gradients, ParamId, ParameterStore};
use crate::MamlResult;
use scirs2_core::ndarray::Array2;
use std::collections::HashMap;

/// SGD optimizer with momentum.
#[derive(Debug)]
pub struct SgdOptimizer {
    config: OptimizerConfig,
    /// Momentum buffers for each parameter.
    velocity: HashMap<ParamId, Array2<f64>>,
}

impl SgdOptimizer {
    /// Create a new SGD optimizer.
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for SgdOptimizer {
    fn step(&mut self, parameters: &mut ParameterStore, gradients: &Gradients) -> MamlResult<()> {
        let gradients = prepare_gradients(&self.config, parameters, gradients)?;
        let lr = self.config.learning_rate;
        let momentum = self.config.momentum;

        for (id, param) in parameters.iter_mut().filter(|(_, p)| p.trainable) {
            let grad = gradient_for(&gradients, id, &param.name)?;

            let velocity = self
                .velocity
                .entry(id)
                .or_insert_with(|| Array2::zeros(param.value.raw_dim()));

            // v = momentum * v + lr * grad
            velocity.mapv_inplace(|v| momentum * v);
            velocity.scaled_add(lr, grad);

            // param = param - v
            param.value -= &*velocity;
        }

        Ok(())
    }

    fn get_lr(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_lr(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    fn state_dict(&self) -> HashMap<String, Vec<f64>> {
        let mut state = HashMap::new();
        export_buffers(&mut state, "velocity", &self.velocity);
        state
    }

    fn load_state_dict(
        &mut self,
        state: &HashMap<String, Vec<f64>>,
        parameters: &ParameterStore,
    ) -> MamlResult<()> {
        self.velocity = import_buffers(state, "velocity", parameters)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizers::GradClipMode;
    use scirs2_core::ndarray::array;

    fn setup() -> (ParameterStore, ParamId, Gradients) {
        let mut store = ParameterStore::new();
        let w = store.register("w", array![[1.0, 2.0]]).unwrap();
        let mut grads = Gradients::new();
        grads.accumulate(w, array![[0.1, 0.1]]).unwrap();
        (store, w, grads)
    }

    #[test]
    fn test_sgd_optimizer() {
        let (mut store, w, grads) = setup();
        let mut optimizer = SgdOptimizer::new(OptimizerConfig {
            learning_rate: 0.1,
            momentum: 0.9,
            ..Default::default()
        });

        optimizer.step(&mut store, &grads).unwrap();
        let value = store.value(w).unwrap();
        assert!((value[[0, 0]] - 0.99).abs() < 1e-12);

        // momentum carries the previous velocity
        optimizer.step(&mut store, &grads).unwrap();
        let value = store.value(w).unwrap();
        assert!((value[[0, 0]] - (0.99 - 0.019)).abs() < 1e-12);

        let state = optimizer.state_dict();
        assert!(state.contains_key("velocity_0"));
    }

    #[test]
    fn test_gradient_clipping() {
        let mut store = ParameterStore::new();
        let w = store.register("w", array![[1.0]]).unwrap();
        let mut grads = Gradients::new();
        grads.accumulate(w, array![[1.0]]).unwrap();
        let mut optimizer = SgdOptimizer::new(OptimizerConfig {
            learning_rate: 0.1,
            grad_clip: Some(0.05),
            grad_clip_mode: GradClipMode::Value,
            ..Default::default()
        });

        optimizer.step(&mut store, &grads).unwrap();
        assert!((store.value(w).unwrap()[[0, 0]] - 0.995).abs() < 1e-12);
    }

    #[test]
    fn test_frozen_parameter_is_skipped() {
        let (mut store, w, _) = setup();
        store.freeze(&[w]).unwrap();
        let mut optimizer = SgdOptimizer::new(OptimizerConfig::default());
        optimizer.step(&mut store, &Gradients::new()).unwrap();
        assert_eq!(store.value(w).unwrap(), &array![[1.0, 2.0]]);
    }

    #[test]
    fn test_missing_gradient_is_an_error() {
        let (mut store, _, _) = setup();
        let mut optimizer = SgdOptimizer::new(OptimizerConfig::default());
        assert!(optimizer.step(&mut store, &Gradients::new()).is_err());
    }

    #[test]
    fn test_state_dict_restores_velocity() {
        let (mut store, w, grads) = setup();
        let config = OptimizerConfig {
            learning_rate: 0.1,
            momentum: 0.5,
            ..Default::default()
        };
        let mut running = SgdOptimizer::new(config.clone());
        running.step(&mut store, &grads).unwrap();

        let mut resumed = SgdOptimizer::new(config);
        resumed
            .load_state_dict(&running.state_dict(), &store)
            .unwrap();
        assert_eq!(resumed.state_dict(), running.state_dict());

        // the next step of a resumed optimizer matches the one that kept running
        let mut resumed_store = store.clone();
        running.step(&mut store, &grads).unwrap();
        resumed.step(&mut resumed_store, &grads).unwrap();
        assert_eq!(store.value(w).unwrap(), resumed_store.value(w).unwrap());
    }

    #[test]
    fn test_load_state_dict_rejects_wrong_shape() {
        let (store, _, _) = setup();
        let mut state = HashMap::new();
        state.insert("velocity_0".to_string(), vec![1.0, 2.0, 3.0]);
        let mut optimizer = SgdOptimizer::new(OptimizerConfig::default());
        assert!(optimizer.load_state_dict(&state, &store).is_err());
    }
}
