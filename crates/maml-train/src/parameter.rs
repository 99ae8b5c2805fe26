//! Persistent parameters and per-episode fast weights.
//!
//! Persistent (meta) values live in a [`ParameterStore`] owned by the model.
//! An episode binds them onto its tape as [`MetaLeaves`] and keeps its adapted
//! values in a separate [`FastWeights`] map, created empty for every episode.
//! Modules see both through a [`WeightView`], which prefers the fast override.

use crate::{MamlError, MamlResult};
use maml_autograd::{Tape, Var};
use scirs2_core::ndarray::Array2;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Position of a parameter in its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamId(usize);

impl ParamId {
    /// Index into the store's ordered parameter list.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named persistent tensor.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub value: Array2<f64>,
    /// Frozen parameters are neither adapted nor stepped.
    pub trainable: bool,
}

/// Ordered list of a model's persistent parameters.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    params: Vec<Parameter>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trainable parameter. Names must be unique.
    pub fn register(&mut self, name: impl Into<String>, value: Array2<f64>) -> MamlResult<ParamId> {
        let name = name.into();
        if self.params.iter().any(|p| p.name == name) {
            return Err(MamlError::Config(format!(
                "Parameter '{}' is already registered",
                name
            )));
        }
        self.params.push(Parameter {
            name,
            value,
            trainable: true,
        });
        Ok(ParamId(self.params.len() - 1))
    }

    pub fn get(&self, id: ParamId) -> Option<&Parameter> {
        self.params.get(id.0)
    }

    pub fn get_mut(&mut self, id: ParamId) -> Option<&mut Parameter> {
        self.params.get_mut(id.0)
    }

    /// Persistent value of `id`.
    pub fn value(&self, id: ParamId) -> MamlResult<&Array2<f64>> {
        self.get(id)
            .map(|p| &p.value)
            .ok_or_else(|| unknown_parameter(id))
    }

    /// Id of the parameter called `name`.
    pub fn find(&self, name: &str) -> Option<ParamId> {
        self.params.iter().position(|p| p.name == name).map(ParamId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Parameter)> {
        self.params.iter().enumerate().map(|(i, p)| (ParamId(i), p))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ParamId, &mut Parameter)> {
        self.params
            .iter_mut()
            .enumerate()
            .map(|(i, p)| (ParamId(i), p))
    }

    /// Ids of the parameters that are adapted and stepped.
    pub fn trainable_ids(&self) -> Vec<ParamId> {
        self.iter()
            .filter(|(_, p)| p.trainable)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn set_trainable(&mut self, id: ParamId, trainable: bool) -> MamlResult<()> {
        let param = self.get_mut(id).ok_or_else(|| unknown_parameter(id))?;
        param.trainable = trainable;
        Ok(())
    }

    /// Exclude `ids` from adaptation and optimizer steps.
    pub fn freeze(&mut self, ids: &[ParamId]) -> MamlResult<()> {
        for &id in ids {
            self.set_trainable(id, false)?;
        }
        Ok(())
    }

    /// Number of registered tensors.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.params.iter().map(|p| p.value.len()).sum()
    }

    /// Flattened values keyed by parameter name.
    pub fn state_dict(&self) -> HashMap<String, Vec<f64>> {
        self.params
            .iter()
            .map(|p| (p.name.clone(), p.value.iter().copied().collect()))
            .collect()
    }

    /// Overwrite values from a state dict produced by [`state_dict`](Self::state_dict).
    pub fn load_state_dict(&mut self, state: &HashMap<String, Vec<f64>>) -> MamlResult<()> {
        for (name, values) in state {
            let param = self
                .params
                .iter_mut()
                .find(|p| &p.name == name)
                .ok_or_else(|| {
                    MamlError::Checkpoint(format!("Parameter '{}' not found in model", name))
                })?;
            if param.value.len() != values.len() {
                return Err(MamlError::Checkpoint(format!(
                    "Parameter '{}' size mismatch: expected {}, got {}",
                    name,
                    param.value.len(),
                    values.len()
                )));
            }
            for (p, v) in param.value.iter_mut().zip(values) {
                *p = *v;
            }
        }
        Ok(())
    }

    /// Record every persistent value on `tape`.
    ///
    /// Trainable parameters become differentiable leaves; frozen ones become
    /// constants so no gradient reaches them.
    pub fn bind(&self, tape: &Tape) -> MetaLeaves {
        let leaves = self
            .params
            .iter()
            .map(|p| {
                if p.trainable {
                    tape.leaf(p.value.clone())
                } else {
                    tape.constant(p.value.clone())
                }
            })
            .collect();
        MetaLeaves {
            tape: tape.clone(),
            leaves,
            trainable: self.trainable_ids(),
        }
    }
}

fn unknown_parameter(id: ParamId) -> MamlError {
    MamlError::Shape(format!("Unknown parameter {}", id))
}

/// Persistent values recorded on one tape.
#[derive(Debug, Clone)]
pub struct MetaLeaves {
    tape: Tape,
    leaves: Vec<Var>,
    trainable: Vec<ParamId>,
}

impl MetaLeaves {
    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    pub fn get(&self, id: ParamId) -> Option<&Var> {
        self.leaves.get(id.0)
    }

    /// Ids that were bound as differentiable leaves.
    pub fn trainable_ids(&self) -> &[ParamId] {
        &self.trainable
    }

    /// The differentiable leaves, in id order.
    pub fn trainable_leaves(&self) -> Vec<Var> {
        self.trainable
            .iter()
            .map(|id| self.leaves[id.0].clone())
            .collect()
    }
}

/// Per-episode overrides of persistent values.
#[derive(Debug, Clone, Default)]
pub struct FastWeights {
    weights: BTreeMap<ParamId, Var>,
}

impl FastWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ParamId) -> Option<&Var> {
        self.weights.get(&id)
    }

    pub fn insert(&mut self, id: ParamId, weight: Var) {
        self.weights.insert(id, weight);
    }

    pub fn contains(&self, id: ParamId) -> bool {
        self.weights.contains_key(&id)
    }

    pub fn clear(&mut self) {
        self.weights.clear();
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Var)> {
        self.weights.iter().map(|(id, var)| (*id, var))
    }

    /// Current values, copied off the tape.
    pub fn values(&self) -> BTreeMap<ParamId, Array2<f64>> {
        self.iter().map(|(id, var)| (id, var.value())).collect()
    }
}

/// Weight lookup handed to [`Adaptable::forward`](crate::Adaptable::forward).
#[derive(Debug, Clone, Copy)]
pub struct WeightView<'a> {
    leaves: &'a MetaLeaves,
    fast: Option<&'a FastWeights>,
}

impl<'a> WeightView<'a> {
    /// Persistent values only.
    pub fn persistent(leaves: &'a MetaLeaves) -> Self {
        Self { leaves, fast: None }
    }

    /// Fast overrides where present, persistent values elsewhere.
    pub fn with_fast(leaves: &'a MetaLeaves, fast: &'a FastWeights) -> Self {
        Self {
            leaves,
            fast: Some(fast),
        }
    }

    pub fn tape(&self) -> &Tape {
        self.leaves.tape()
    }

    /// The tensor a module should use for `id`.
    pub fn resolve(&self, id: ParamId) -> MamlResult<Var> {
        if let Some(weight) = self.fast.and_then(|fast| fast.get(id)) {
            return Ok(weight.clone());
        }
        self.leaves
            .get(id)
            .cloned()
            .ok_or_else(|| unknown_parameter(id))
    }
}

/// Gradient buffer for persistent parameters.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    grads: BTreeMap<ParamId, Array2<f64>>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `grad` into the slot for `id`.
    pub fn accumulate(&mut self, id: ParamId, grad: Array2<f64>) -> MamlResult<()> {
        match self.grads.get_mut(&id) {
            Some(existing) if existing.dim() != grad.dim() => Err(MamlError::Shape(format!(
                "Gradient for {} has shape {:?}, buffer holds {:?}",
                id,
                grad.dim(),
                existing.dim()
            ))),
            Some(existing) => {
                *existing += &grad;
                Ok(())
            }
            None => {
                self.grads.insert(id, grad);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: ParamId) -> Option<&Array2<f64>> {
        self.grads.get(&id)
    }

    /// Drop every buffered gradient.
    pub fn zero(&mut self) {
        self.grads.clear();
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Array2<f64>)> {
        self.grads.iter().map(|(id, g)| (*id, g))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ParamId, &mut Array2<f64>)> {
        self.grads.iter_mut().map(|(id, g)| (*id, g))
    }

    /// Global L2 norm over every buffered gradient.
    pub fn norm(&self) -> f64 {
        self.grads
            .values()
            .flat_map(|g| g.iter())
            .map(|g| g * g)
            .sum::<f64>()
            .sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.grads.values().all(|g| g.iter().all(|v| v.is_finite()))
    }
}
