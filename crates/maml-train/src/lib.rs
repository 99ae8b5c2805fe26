//! Model-Agnostic Meta-Learning (MAML) for few-shot classification.
//!
//! MAML learns initial weights from which a few gradient steps on a new
//! task's support set give a good classifier for that task's query set. Each
//! episode runs an inner loop of `task_update_num` SGD steps on per-episode
//! fast weights, recorded on a [`maml_autograd::Tape`] so the query loss can
//! be differentiated back through every step into the persistent weights.
//! `first_order = true` detaches the inner gradients instead.
//!
//! - [`Maml`]: episode driver, [`Maml::train_loop`] and [`Maml::test_loop`]
//! - [`InnerLoopAdapter`]: the K-step inner loop
//! - [`ParameterStore`], [`FastWeights`], [`WeightView`]: persistent and adapted weights
//! - [`Adaptable`]: fast-weight aware modules ([`Linear`], [`Mlp`], [`Flatten`])
//! - [`MetaBatchAccumulator`]: deferred outer step over `n_task` episodes
//! - [`SgdOptimizer`], [`AdamOptimizer`]: outer optimizers
//!
//! ```
//! use maml_train::{
//!     AdamOptimizer, Maml, MamlConfig, MamlModel, OptimizerConfig, SyntheticEpisodeSampler,
//! };
//! use scirs2_core::random::{SeedableRng, StdRng};
//!
//! let config = MamlConfig {
//!     n_way: 3,
//!     n_support: 1,
//!     test_n_support: 1,
//!     task_update_num: 2,
//!     first_order: true,
//!     ..Default::default()
//! };
//! let model = MamlModel::mlp(&[4, 16], config.n_way, &mut StdRng::seed_from_u64(0))?;
//! let mut maml = Maml::new(model, config)?;
//!
//! let mut sampler = SyntheticEpisodeSampler::new(10, 3, 4, 4, 1)?;
//! let mut optimizer = AdamOptimizer::new(OptimizerConfig::default());
//! let summary = maml.train_loop(0, sampler.sample_batches(4), &mut optimizer)?;
//! assert_eq!(summary.outer_steps, 4);
//!
//! let report = maml.test_loop(sampler.sample_batches(5), true)?;
//! assert!(report.mean >= 0.0 && report.mean <= 100.0);
//! # Ok::<(), maml_train::MamlError>(())
//! ```

mod adapter;
mod config;
mod episode;
mod error;
mod loss;
mod maml;
mod meta_batch;
mod metrics;
mod module;
mod optimizers;
mod parameter;
mod stats;

#[cfg(feature = "structured-logging")]
pub mod structured_logging;

pub use adapter::{Adaptation, InnerLoopAdapter, InnerLoopConfig};
pub use config::{MamlConfig, MetaLossReduction};
pub use episode::{episode_labels, EpisodeBatch, EpisodeSplit, InputKind, SyntheticEpisodeSampler};
pub use error::{MamlError, MamlResult, UsageError};
pub use loss::{CrossEntropyLoss, Loss};
pub use maml::{EpisodeForward, EpisodeLoss, Maml, TrainLoopSummary};
pub use meta_batch::{MetaBatchAccumulator, TapeSession};
pub use metrics::{top1_correct, AccuracyReport, AccuracyStats};
pub use module::{Adaptable, FeatureExtractor, Flatten, Linear, MamlModel, Mlp};
pub use optimizers::{AdamOptimizer, GradClipMode, Optimizer, OptimizerConfig, SgdOptimizer};
pub use parameter::{
    FastWeights, Gradients, MetaLeaves, ParamId, Parameter, ParameterStore, WeightView,
};
pub use stats::MetaStats;
