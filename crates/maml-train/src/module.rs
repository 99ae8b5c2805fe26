//! Fast-weight aware modules.
//!
//! Every module reads its parameters through a [`WeightView`], so the same
//! module can be evaluated under an episode's adapted weights without
//! touching the persistent values.

use crate::parameter::{ParamId, ParameterStore, WeightView};
use crate::MamlResult;
use maml_autograd::Var;
use scirs2_core::ndarray::Array2;
use scirs2_core::random::{Rng, StdRng};
use std::fmt::Debug;

/// A learnable computation whose parameters may be overridden per episode.
pub trait Adaptable: Debug {
    /// Forward pass using `weights` for every owned parameter.
    fn forward(&self, input: &Var, weights: &WeightView<'_>) -> MamlResult<Var>;

    /// Parameters this module reads.
    fn parameter_ids(&self) -> Vec<ParamId>;
}

/// A backbone mapping flattened inputs to feature rows.
pub trait FeatureExtractor: Adaptable {
    /// Width of the produced feature rows.
    fn feat_dim(&self) -> usize;
}

/// `y = x W + b` with `W: in×out`, `b: 1×out`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: ParamId,
    bias: ParamId,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Register `{name}.weight` and `{name}.bias`, drawn from `U(-1/sqrt(in), 1/sqrt(in))`.
    pub fn new(
        store: &mut ParameterStore,
        name: &str,
        in_features: usize,
        out_features: usize,
        rng: &mut StdRng,
    ) -> MamlResult<Self> {
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        let mut uniform = |rows: usize, cols: usize| {
            Array2::from_shape_fn((rows, cols), |_| rng.random_range(-bound..bound))
        };
        let weight = store.register(format!("{}.weight", name), uniform(in_features, out_features))?;
        let bias = store.register(format!("{}.bias", name), uniform(1, out_features))?;
        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Same as [`new`](Self::new) with the bias zero-filled.
    pub fn with_zero_bias(
        store: &mut ParameterStore,
        name: &str,
        in_features: usize,
        out_features: usize,
        rng: &mut StdRng,
    ) -> MamlResult<Self> {
        let layer = Self::new(store, name, in_features, out_features, rng)?;
        if let Some(bias) = store.get_mut(layer.bias) {
            bias.value.fill(0.0);
        }
        Ok(layer)
    }

    pub fn weight(&self) -> ParamId {
        self.weight
    }

    pub fn bias(&self) -> ParamId {
        self.bias
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Adaptable for Linear {
    fn forward(&self, input: &Var, weights: &WeightView<'_>) -> MamlResult<Var> {
        let weight = weights.resolve(self.weight)?;
        let bias = weights.resolve(self.bias)?;
        Ok(input.matmul(&weight)?.add_row(&bias)?)
    }

    fn parameter_ids(&self) -> Vec<ParamId> {
        vec![self.weight, self.bias]
    }
}

/// Fully connected backbone with ReLU after every layer.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    /// Layers `dims[0] -> dims[1] -> ... -> dims[n]`, named `{name}.{i}`.
    pub fn new(
        store: &mut ParameterStore,
        name: &str,
        dims: &[usize],
        rng: &mut StdRng,
    ) -> MamlResult<Self> {
        if dims.len() < 2 {
            return Err(crate::MamlError::Config(format!(
                "Mlp needs at least input and output widths, got {:?}",
                dims
            )));
        }
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, pair)| Linear::new(store, &format!("{}.{}", name, i), pair[0], pair[1], rng))
            .collect::<MamlResult<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }
}

impl Adaptable for Mlp {
    fn forward(&self, input: &Var, weights: &WeightView<'_>) -> MamlResult<Var> {
        let mut hidden = input.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, weights)?.relu();
        }
        Ok(hidden)
    }

    fn parameter_ids(&self) -> Vec<ParamId> {
        self.layers.iter().flat_map(Linear::parameter_ids).collect()
    }
}

impl FeatureExtractor for Mlp {
    fn feat_dim(&self) -> usize {
        self.layers.last().map_or(0, Linear::out_features)
    }
}

/// Parameter-free backbone that passes flattened inputs through.
#[derive(Debug, Clone, Copy)]
pub struct Flatten {
    dim: usize,
}

impl Flatten {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Adaptable for Flatten {
    fn forward(&self, input: &Var, _weights: &WeightView<'_>) -> MamlResult<Var> {
        if input.shape().1 != self.dim {
            return Err(crate::MamlError::Shape(format!(
                "Flatten expects {} features, got {}",
                self.dim,
                input.shape().1
            )));
        }
        Ok(input.clone())
    }

    fn parameter_ids(&self) -> Vec<ParamId> {
        Vec::new()
    }
}

impl FeatureExtractor for Flatten {
    fn feat_dim(&self) -> usize {
        self.dim
    }
}

/// Backbone followed by a linear classifier over `n_way` classes.
#[derive(Debug)]
pub struct MamlModel {
    store: ParameterStore,
    feature: Box<dyn FeatureExtractor>,
    classifier: Linear,
}

impl MamlModel {
    /// Attach a zero-bias classifier to `feature`, whose parameters are already in `store`.
    pub fn new(
        mut store: ParameterStore,
        feature: Box<dyn FeatureExtractor>,
        n_way: usize,
        rng: &mut StdRng,
    ) -> MamlResult<Self> {
        let classifier =
            Linear::with_zero_bias(&mut store, "classifier", feature.feat_dim(), n_way, rng)?;
        Ok(Self {
            store,
            feature,
            classifier,
        })
    }

    /// `Mlp` backbone over `dims`, then the classifier.
    pub fn mlp(dims: &[usize], n_way: usize, rng: &mut StdRng) -> MamlResult<Self> {
        let mut store = ParameterStore::new();
        let feature = Mlp::new(&mut store, "feature", dims, rng)?;
        Self::new(store, Box::new(feature), n_way, rng)
    }

    /// Classifier directly on the flattened input.
    pub fn linear(input_dim: usize, n_way: usize, rng: &mut StdRng) -> MamlResult<Self> {
        Self::new(ParameterStore::new(), Box::new(Flatten::new(input_dim)), n_way, rng)
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    pub fn classifier(&self) -> &Linear {
        &self.classifier
    }

    pub fn feature(&self) -> &dyn FeatureExtractor {
        self.feature.as_ref()
    }

    /// Freeze every backbone parameter.
    pub fn freeze_feature(&mut self) -> MamlResult<()> {
        let ids = self.feature.parameter_ids();
        self.store.freeze(&ids)
    }

    pub fn n_way(&self) -> usize {
        self.classifier.out_features()
    }
}

impl Adaptable for MamlModel {
    fn forward(&self, input: &Var, weights: &WeightView<'_>) -> MamlResult<Var> {
        let features = self.feature.forward(input, weights)?;
        self.classifier.forward(&features, weights)
    }

    fn parameter_ids(&self) -> Vec<ParamId> {
        let mut ids = self.feature.parameter_ids();
        ids.extend(self.classifier.parameter_ids());
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maml_autograd::Tape;
    use scirs2_core::ndarray::array;
    use scirs2_core::random::SeedableRng;

    #[test]
    fn test_linear_init_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut store = ParameterStore::new();
        let layer = Linear::new(&mut store, "fc", 16, 4, &mut rng).unwrap();
        let w = store.value(layer.weight()).unwrap();
        assert_eq!(w.dim(), (16, 4));
        assert!(w.iter().all(|v| v.abs() <= 0.25));
        assert!(w.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_classifier_bias_is_zero() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = MamlModel::mlp(&[4, 8], 3, &mut rng).unwrap();
        let bias = model.parameters().value(model.classifier().bias()).unwrap();
        assert!(bias.iter().all(|v| *v == 0.0));
        assert_eq!(model.n_way(), 3);
        assert_eq!(model.parameters().len(), 4);
        assert_eq!(model.parameter_ids().len(), 4);
    }

    #[test]
    fn test_forward_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let model = MamlModel::mlp(&[3, 5, 4], 2, &mut rng).unwrap();
        let tape = Tape::new();
        let leaves = model.parameters().bind(&tape);
        let x = tape.constant(array![[1.0, 0.0, -1.0], [0.5, 0.5, 0.5]]);
        let scores = model.forward(&x, &WeightView::persistent(&leaves)).unwrap();
        assert_eq!(scores.shape(), (2, 2));
    }

    #[test]
    fn test_flatten_checks_width() {
        let tape = Tape::new();
        let leaves = ParameterStore::new().bind(&tape);
        let x = tape.constant(array![[1.0, 2.0]]);
        let view = WeightView::persistent(&leaves);
        assert!(Flatten::new(2).forward(&x, &view).is_ok());
        assert!(Flatten::new(3).forward(&x, &view).is_err());
    }

    #[test]
    fn test_same_seed_same_init() {
        let a = MamlModel::mlp(&[4, 4], 2, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = MamlModel::mlp(&[4, 4], 2, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a.parameters().state_dict(), b.parameters().state_dict());
    }

    #[test]
    fn test_freeze_feature() {
        let mut model = MamlModel::mlp(&[4, 4], 2, &mut StdRng::seed_from_u64(3)).unwrap();
        model.freeze_feature().unwrap();
        assert_eq!(
            model.parameters().trainable_ids(),
            model.classifier().parameter_ids()
        );
    }
}
