//! Common optimizer utilities and traits.

use crate::parameter::{Gradients, ParamId, ParameterStore};
use crate::{MamlError, MamlResult};
use scirs2_core::ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Gradient clipping mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradClipMode {
    /// Clip by value (element-wise).
    Value,
    /// Clip by global L2 norm.
    Norm,
}

/// Configuration for optimizers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Learning rate.
    pub learning_rate: f64,
    /// Momentum (for SGD).
    pub momentum: f64,
    /// Beta1 (for Adam).
    pub beta1: f64,
    /// Beta2 (for Adam).
    pub beta2: f64,
    /// Epsilon for numerical stability.
    pub epsilon: f64,
    /// L2 penalty added to the gradient.
    pub weight_decay: f64,
    /// Gradient clipping threshold (None = no clipping).
    pub grad_clip: Option<f64>,
    /// Gradient clipping mode.
    pub grad_clip_mode: GradClipMode,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            momentum: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            grad_clip: None,
            grad_clip_mode: GradClipMode::Value,
        }
    }
}

/// Trait for optimizers over a [`ParameterStore`].
///
/// Frozen parameters are skipped; every trainable parameter must have a gradient.
pub trait Optimizer {
    /// Update trainable parameters with computed gradients.
    fn step(&mut self, parameters: &mut ParameterStore, gradients: &Gradients) -> MamlResult<()>;

    /// Get current learning rate.
    fn get_lr(&self) -> f64;

    /// Set learning rate.
    fn set_lr(&mut self, lr: f64);

    /// Get optimizer state for checkpointing.
    fn state_dict(&self) -> HashMap<String, Vec<f64>>;

    /// Replace optimizer state from a checkpoint of the same `parameters`.
    fn load_state_dict(
        &mut self,
        state: &HashMap<String, Vec<f64>>,
        parameters: &ParameterStore,
    ) -> MamlResult<()>;
}

/// Copy of `gradients` with clipping and weight decay applied.
pub(crate) fn prepare_gradients(
    config: &OptimizerConfig,
    parameters: &ParameterStore,
    gradients: &Gradients,
) -> MamlResult<Gradients> {
    if !gradients.is_finite() {
        return Err(MamlError::Numerical(
            "Non-finite gradient passed to optimizer".to_string(),
        ));
    }
    let mut prepared = gradients.clone();

    if let Some(clip_value) = config.grad_clip {
        match config.grad_clip_mode {
            GradClipMode::Value => {
                for (_, grad) in prepared.iter_mut() {
                    grad.mapv_inplace(|g| g.clamp(-clip_value, clip_value));
                }
            }
            GradClipMode::Norm => {
                let total_norm = prepared.norm();
                if total_norm > clip_value {
                    let scale = clip_value / total_norm;
                    for (_, grad) in prepared.iter_mut() {
                        grad.mapv_inplace(|g| g * scale);
                    }
                }
            }
        }
    }

    if config.weight_decay != 0.0 {
        for (id, grad) in prepared.iter_mut() {
            let value = parameters.value(id)?;
            grad.scaled_add(config.weight_decay, value);
        }
    }

    Ok(prepared)
}

/// Gradient for trainable `id`, or an optimizer error naming the parameter.
pub(crate) fn gradient_for<'a>(
    gradients: &'a Gradients,
    id: ParamId,
    name: &str,
) -> MamlResult<&'a Array2<f64>> {
    gradients.get(id).ok_or_else(|| {
        MamlError::Optimizer(format!("Missing gradient for parameter: {}", name))
    })
}

/// Flatten a per-parameter buffer map into state-dict entries named `{prefix}_{index}`.
pub(crate) fn export_buffers(
    state: &mut HashMap<String, Vec<f64>>,
    prefix: &str,
    buffers: &HashMap<ParamId, Array2<f64>>,
) {
    for (id, buffer) in buffers {
        state.insert(
            format!("{}_{}", prefix, id.index()),
            buffer.iter().copied().collect(),
        );
    }
}

/// Rebuild per-parameter buffers from `{prefix}_{index}` entries.
///
/// Buffers take the shape of the matching parameter in `parameters`. Entries
/// naming an unknown parameter or holding the wrong number of values are
/// checkpoint errors; parameters without an entry get no buffer.
pub(crate) fn import_buffers(
    state: &HashMap<String, Vec<f64>>,
    prefix: &str,
    parameters: &ParameterStore,
) -> MamlResult<HashMap<ParamId, Array2<f64>>> {
    let mut buffers = HashMap::new();
    for (id, param) in parameters.iter() {
        let key = format!("{}_{}", prefix, id.index());
        if let Some(values) = state.get(&key) {
            let buffer = Array2::from_shape_vec(param.value.raw_dim(), values.clone())
                .map_err(|_| {
                    MamlError::Checkpoint(format!(
                        "'{}' holds {} values but parameter '{}' has shape {:?}",
                        key,
                        values.len(),
                        param.name,
                        param.value.dim()
                    ))
                })?;
            buffers.insert(id, buffer);
        }
    }

    let entries = state
        .keys()
        .filter(|key| {
            key.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('_'))
                .is_some_and(|index| index.parse::<usize>().is_ok())
        })
        .count();
    if entries != buffers.len() {
        return Err(MamlError::Checkpoint(format!(
            "{} '{}' buffers for {} known parameters",
            entries,
            prefix,
            buffers.len()
        )));
    }
    Ok(buffers)
}
