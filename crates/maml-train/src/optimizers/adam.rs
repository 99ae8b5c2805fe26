//! Adam optimizer (Adaptive Moment Estimation).
//!
//! Adam maintains first-order (momentum) and second-order moment estimates
//! of the gradients with bias correction folded into the step size.
//!
//! Reference: Kingma & Ba, "Adam: A Method for Stochastic Optimization", ICLR 2015

use super::common::{
    export_buffers, gradient_for, import_buffers, prepare_gradients, Optimizer, OptimizerConfig,
};
use crate::parameter::{Gradients, ParamId, ParameterStore};
use crate::{MamlError, MamlResult};
use scirs2_core::ndarray::Array2;
use std::collections::HashMap;

/// Adam optimizer.
#[derive(Debug)]
pub struct AdamOptimizer {
    config: OptimizerConfig,
    /// First moment estimates (exponential moving average of gradients).
    m: HashMap<ParamId, Array2<f64>>,
    /// Second moment estimates (exponential moving average of squared gradients).
    v: HashMap<ParamId, Array2<f64>>,
    /// Timestep counter.
    t: usize,
}

impl AdamOptimizer {
    /// Create a new Adam optimizer.
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        }
    }

    /// Steps taken so far.
    pub fn timestep(&self) -> usize {
        self.t
    }
}

impl Optimizer for AdamOptimizer {
    fn step(&mut self, parameters: &mut ParameterStore, gradients: &Gradients) -> MamlResult<()> {
        let gradients = prepare_gradients(&self.config, parameters, gradients)?;
        self.t += 1;
        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;
        let eps = self.config.epsilon;
        let lr_t = self.config.learning_rate * (1.0 - beta2.powi(self.t as i32)).sqrt()
            / (1.0 - beta1.powi(self.t as i32));

        for (id, param) in parameters.iter_mut().filter(|(_, p)| p.trainable) {
            let grad = gradient_for(&gradients, id, &param.name)?;
            let m = self
                .m
                .entry(id)
                .or_insert_with(|| Array2::zeros(param.value.raw_dim()));
            let v = self
                .v
                .entry(id)
                .or_insert_with(|| Array2::zeros(param.value.raw_dim()));

            *m = &*m * beta1 + &(grad * (1.0 - beta1));
            *v = &*v * beta2 + &(grad.mapv(|g| g * g) * (1.0 - beta2));
            let update = m.mapv(|m_val| m_val * lr_t) / &v.mapv(|v_val| v_val.sqrt() + eps);
            param.value -= &update;
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
        state.insert("t".to_string(), vec![self.t as f64]);
        export_buffers(&mut state, "m", &self.m);
        export_buffers(&mut state, "v", &self.v);
        state
    }

    fn load_state_dict(
        &mut self,
        state: &HashMap<String, Vec<f64>>,
        parameters: &ParameterStore,
    ) -> MamlResult<()> {
        let t = match state.get("t").map(Vec::as_slice) {
            Some(&[t]) if t >= 0.0 && t.fract() == 0.0 => t as usize,
            _ => {
                return Err(MamlError::Checkpoint(
                    "Adam state needs a single non-negative integer timestep 't'".to_string(),
                ))
            }
        };
        let m = import_buffers(state, "m", parameters)?;
        let v = import_buffers(state, "v", parameters)?;
        if m.len() != v.len() || m.keys().any(|id| !v.contains_key(id)) {
            return Err(MamlError::Checkpoint(
                "Adam first and second moments cover different parameters".to_string(),
            ));
        }
        self.t = t;
        self.m = m;
        self.v = v;
        Ok(())
    }
}
