//! Episodic batches for N-way few-shot tasks.
//!
//! An episode batch is shaped `(n_way, shots_per_class, ...feature dims)`:
//! class groups first, then examples, with the first `n_support` examples of
//! each class forming the support set and the rest the query set. Labels are
//! never read from the loader: within an episode, class `c` is the `c`-th
//! group.

use crate::{MamlError, MamlResult};
use scirs2_core::ndarray::{Array2, Array3, ArrayD, IxDyn};
use scirs2_core::random::{Rng, SeedableRng, StdRng};

/// What the episode data holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputKind {
    /// Raw inputs that go through the backbone.
    #[default]
    Raw,
    /// Features precomputed by a frozen backbone.
    Features,
}

/// One episode as produced by a loader.
#[derive(Debug, Clone)]
pub struct EpisodeBatch {
    /// `(n_way, shots_per_class, ...feature dims)`.
    pub data: ArrayD<f64>,
    /// Global class ids the loader sampled; informational only.
    pub classes: Option<Vec<usize>>,
}

impl EpisodeBatch {
    /// Wrap `data`, which needs at least a class and an example axis.
    pub fn new(data: ArrayD<f64>) -> MamlResult<Self> {
        if data.ndim() < 2 {
            return Err(MamlError::Shape(format!(
                "Episode data needs (n_way, shots, ...) axes, got shape {:?}",
                data.shape()
            )));
        }
        if data.is_empty() {
            return Err(MamlError::EmptyInput(format!(
                "episode of shape {:?}",
                data.shape()
            )));
        }
        Ok(Self {
            data,
            classes: None,
        })
    }

    /// Build from a `(n_way, shots, dim)` cube.
    pub fn from_cube(cube: Array3<f64>) -> MamlResult<Self> {
        Self::new(cube.into_dyn())
    }

    pub fn with_classes(mut self, classes: Vec<usize>) -> Self {
        self.classes = Some(classes);
        self
    }

    /// Number of class groups.
    pub fn n_way(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn shots_per_class(&self) -> usize {
        self.data.shape()[1]
    }

    /// Flattened width of one example.
    pub fn feature_dim(&self) -> usize {
        self.data.shape()[2..].iter().product()
    }

    /// Split into flattened support and query sets.
    pub fn split(&self, n_support: usize) -> MamlResult<EpisodeSplit> {
        let n_way = self.n_way();
        let shots = self.shots_per_class();
        if n_support == 0 || n_support >= shots {
            return Err(MamlError::Shape(format!(
                "Episode has {} examples per class, cannot take {} support and leave a query set",
                shots, n_support
            )));
        }
        let n_query = shots - n_support;
        let dim = self.feature_dim();
        let cube = Array3::from_shape_vec((n_way, shots, dim), self.data.iter().copied().collect())
            .map_err(|e| MamlError::Shape(e.to_string()))?;

        let support = Array2::from_shape_fn((n_way * n_support, dim), |(row, col)| {
            cube[[row / n_support, row % n_support, col]]
        });
        let query = Array2::from_shape_fn((n_way * n_query, dim), |(row, col)| {
            cube[[row / n_query, n_support + row % n_query, col]]
        });

        Ok(EpisodeSplit {
            support,
            query,
            n_way,
            n_support,
            n_query,
        })
    }
}

/// Support and query sets of one episode, class-major.
#[derive(Debug, Clone)]
pub struct EpisodeSplit {
    /// `(n_way * n_support, dim)`.
    pub support: Array2<f64>,
    /// `(n_way * n_query, dim)`.
    pub query: Array2<f64>,
    pub n_way: usize,
    pub n_support: usize,
    pub n_query: usize,
}

impl EpisodeSplit {
    pub fn support_labels(&self) -> Vec<usize> {
        episode_labels(self.n_way, self.n_support)
    }

    pub fn query_labels(&self) -> Vec<usize> {
        episode_labels(self.n_way, self.n_query)
    }
}

/// `[0; per_class] ++ [1; per_class] ++ ... ++ [n_way - 1; per_class]`.
pub fn episode_labels(n_way: usize, per_class: usize) -> Vec<usize> {
    (0..n_way)
        .flat_map(|class| std::iter::repeat_n(class, per_class))
        .collect()
}

/// Random episodes over Gaussian class clusters.
///
/// Each of `n_classes` classes has a mean drawn uniformly from
/// `[-separation, separation]^dim`; examples add isotropic Gaussian noise.
#[derive(Debug, Clone)]
pub struct SyntheticEpisodeSampler {
    n_way: usize,
    shots_per_class: usize,
    noise: f64,
    class_means: Array2<f64>,
    rng: StdRng,
}

impl SyntheticEpisodeSampler {
    pub fn new(
        n_classes: usize,
        n_way: usize,
        shots_per_class: usize,
        feature_dim: usize,
        seed: u64,
    ) -> MamlResult<Self> {
        if n_way == 0 || n_way > n_classes {
            return Err(MamlError::Config(format!(
                "n_way must be in 1..={}, got {}",
                n_classes, n_way
            )));
        }
        if shots_per_class < 2 || feature_dim == 0 {
            return Err(MamlError::Config(format!(
                "Need at least 2 shots per class and 1 feature, got {} and {}",
                shots_per_class, feature_dim
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let separation = 3.0;
        let class_means = Array2::from_shape_fn((n_classes, feature_dim), |_| {
            rng.random_range(-separation..separation)
        });
        Ok(Self {
            n_way,
            shots_per_class,
            noise: 0.3,
            class_means,
            rng,
        })
    }

    /// Standard deviation of the per-example noise.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    pub fn n_classes(&self) -> usize {
        self.class_means.nrows()
    }

    pub fn feature_dim(&self) -> usize {
        self.class_means.ncols()
    }

    fn gaussian(&mut self) -> f64 {
        // Box-Muller; u1 in (0, 1]
        let u1 = 1.0 - self.rng.random::<f64>();
        let u2 = self.rng.random::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Draw `n_way` distinct classes and `shots_per_class` examples of each.
    pub fn sample(&mut self) -> EpisodeBatch {
        let mut pool: Vec<usize> = (0..self.n_classes()).collect();
        for i in 0..self.n_way {
            let j = self.rng.random_range(i..pool.len());
            pool.swap(i, j);
        }
        pool.truncate(self.n_way);

        let dim = self.feature_dim();
        let mut data = ArrayD::zeros(IxDyn(&[self.n_way, self.shots_per_class, dim]));
        for (group, &class) in pool.iter().enumerate() {
            for shot in 0..self.shots_per_class {
                for d in 0..dim {
                    let noise = self.noise * self.gaussian();
                    data[[group, shot, d].as_slice()] = self.class_means[[class, d]] + noise;
                }
            }
        }

        EpisodeBatch {
            data,
            classes: Some(pool),
        }
    }

    /// `count` consecutive episodes.
    pub fn sample_batches(&mut self, count: usize) -> Vec<EpisodeBatch> {
        (0..count).map(|_| self.sample()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scirs2_core::ndarray::Array;

    #[test]
    fn test_split_is_class_major() {
        // value = 100 * class + 10 * shot + feature
        let cube = Array::from_shape_fn((3, 4, 2), |(c, s, f)| (100 * c + 10 * s + f) as f64);
        let batch = EpisodeBatch::from_cube(cube).unwrap();
        let split = batch.split(1).unwrap();

        assert_eq!(split.support.dim(), (3, 2));
        assert_eq!(split.query.dim(), (9, 2));
        assert_eq!(split.support[[1, 1]], 101.0);
        assert_eq!(split.query[[0, 0]], 10.0);
        assert_eq!(split.query[[5, 1]], 131.0);
        assert_eq!(split.support_labels(), vec![0, 1, 2]);
        assert_eq!(split.query_labels(), vec![0, 0, 0, 1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn test_feature_dims_are_flattened() {
        let data = ArrayD::from_elem(IxDyn(&[2, 3, 2, 2]), 1.0);
        let batch = EpisodeBatch::new(data).unwrap();
        assert_eq!(batch.feature_dim(), 4);
        assert_eq!(batch.split(2).unwrap().query.dim(), (2, 4));
    }

    #[test]
    fn test_split_needs_query_rows() {
        let batch = EpisodeBatch::from_cube(Array3::zeros((2, 3, 1))).unwrap();
        assert!(matches!(batch.split(3), Err(MamlError::Shape(_))));
        assert!(batch.split(0).is_err());
    }

    #[test]
    fn test_rejects_flat_data() {
        assert!(EpisodeBatch::new(ArrayD::zeros(IxDyn(&[4]))).is_err());
        assert!(matches!(
            EpisodeBatch::new(ArrayD::zeros(IxDyn(&[0, 3]))),
            Err(MamlError::EmptyInput(_))
        ));
    }

    #[test]
    fn test_episode_labels() {
        assert_eq!(episode_labels(2, 3), vec![0, 0, 0, 1, 1, 1]);
        assert!(episode_labels(3, 0).is_empty());
    }

    #[test]
    fn test_sampler_is_seeded() {
        let mut a = SyntheticEpisodeSampler::new(10, 5, 3, 4, 11).unwrap();
        let mut b = SyntheticEpisodeSampler::new(10, 5, 3, 4, 11).unwrap();
        let (ea, eb) = (a.sample(), b.sample());
        assert_eq!(ea.data, eb.data);
        assert_eq!(ea.classes, eb.classes);
        assert_eq!(ea.data.shape(), &[5, 3, 4]);
    }

    #[test]
    fn test_sampler_draws_distinct_classes() {
        let mut sampler = SyntheticEpisodeSampler::new(6, 6, 2, 1, 5).unwrap();
        let mut classes = sampler.sample().classes.unwrap();
        classes.sort_unstable();
        assert_eq!(classes, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_sampler_rejects_bad_way() {
        assert!(SyntheticEpisodeSampler::new(3, 4, 2, 1, 0).is_err());
        assert!(SyntheticEpisodeSampler::new(3, 2, 1, 1, 0).is_err());
    }
}
