//! The MAML learner: episode driver, meta-training loop and evaluator.

use crate::adapter::{InnerLoopAdapter, InnerLoopConfig};
use crate::episode::{EpisodeBatch, InputKind};
use crate::loss::{CrossEntropyLoss, Loss};
use crate::meta_batch::{MetaBatchAccumulator, TapeSession};
use crate::metrics::{top1_correct, AccuracyReport, AccuracyStats};
use crate::module::{Adaptable, MamlModel};
use crate::optimizers::Optimizer;
use crate::parameter::{FastWeights, Gradients, MetaLeaves, WeightView};
use crate::stats::MetaStats;
use crate::{MamlConfig, MamlError, MamlResult, UsageError};
use maml_autograd::{grad, GradOptions, Var};
use tracing::{debug, info, warn};

/// Query scores of one adapted episode.
#[derive(Debug, Clone)]
pub struct EpisodeForward {
    /// `(n_way * n_query, n_way)` class scores under the adapted weights.
    pub scores: Var,
    pub query_labels: Vec<usize>,
    /// Support loss before each inner step.
    pub inner_losses: Vec<f64>,
    /// Adapted weights; dropped with the episode.
    pub fast: FastWeights,
}

/// Meta-loss of one episode.
#[derive(Debug, Clone)]
pub struct EpisodeLoss {
    /// Query cross-entropy, differentiable w.r.t. the session's leaves.
    pub loss: Var,
    pub value: f64,
    pub inner_losses: Vec<f64>,
}

/// What one pass of [`Maml::train_loop`] did.
#[derive(Debug, Clone, Default)]
pub struct TrainLoopSummary {
    pub epoch: usize,
    /// Episodes consumed.
    pub num_items: usize,
    /// Mean meta-loss over all consumed episodes.
    pub avg_loss: f64,
    /// Optimizer steps taken.
    pub outer_steps: usize,
    /// Episodes left in an incomplete meta-batch at the end.
    pub discarded: usize,
    /// Inner-loss trajectory per episode.
    pub inner_losses: Vec<Vec<f64>>,
    /// Progress lines emitted during the pass.
    pub reports: Vec<String>,
}

/// Model-Agnostic Meta-Learning over a [`MamlModel`].
#[derive(Debug)]
pub struct Maml {
    model: MamlModel,
    config: MamlConfig,
    loss_fn: CrossEntropyLoss,
    n_support: usize,
    grads: Gradients,
    stats: MetaStats,
}

impl Maml {
    /// Wrap `model`, whose classifier must have `config.n_way` outputs.
    pub fn new(model: MamlModel, config: MamlConfig) -> MamlResult<Self> {
        config.validate()?;
        if model.n_way() != config.n_way {
            return Err(MamlError::Config(format!(
                "Classifier has {} outputs but n_way is {}",
                model.n_way(),
                config.n_way
            )));
        }
        Ok(Self {
            n_support: config.n_support,
            model,
            config,
            loss_fn: CrossEntropyLoss,
            grads: Gradients::new(),
            stats: MetaStats::new(),
        })
    }

    /// `Mlp` backbone over `dims` and an `n_way` classifier, initialized
    /// from `config.seed`.
    pub fn with_mlp(dims: &[usize], config: MamlConfig) -> MamlResult<Self> {
        let model = MamlModel::mlp(dims, config.n_way, &mut config.init_rng())?;
        Self::new(model, config)
    }

    pub fn model(&self) -> &MamlModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut MamlModel {
        &mut self.model
    }

    pub fn config(&self) -> &MamlConfig {
        &self.config
    }

    /// Support examples per class used by the next episode.
    pub fn n_support(&self) -> usize {
        self.n_support
    }

    pub fn set_n_support(&mut self, n_support: usize) {
        self.n_support = n_support;
    }

    pub fn stats(&self) -> &MetaStats {
        &self.stats
    }

    /// Gradient buffer filled by [`backward`](Self::backward).
    pub fn gradients(&self) -> &Gradients {
        &self.grads
    }

    /// Clear the gradient buffer.
    pub fn zero_grad(&mut self) {
        self.grads.zero();
    }

    /// Fresh tape with the current persistent parameters bound.
    pub fn begin_session(&self) -> TapeSession {
        TapeSession::bind(self.model.parameters())
    }

    fn adapter(&self, first_order: bool) -> MamlResult<InnerLoopAdapter> {
        InnerLoopAdapter::new(InnerLoopConfig {
            first_order,
            ..InnerLoopConfig::from(&self.config)
        })
    }

    fn check_way(&self, batch: &EpisodeBatch) -> MamlResult<()> {
        if batch.n_way() != self.config.n_way {
            return Err(UsageError::WayMismatch {
                expected: self.config.n_way,
                found: batch.n_way(),
            }
            .into());
        }
        Ok(())
    }

    fn forward_episode(
        &self,
        leaves: &MetaLeaves,
        batch: &EpisodeBatch,
        kind: InputKind,
        first_order: bool,
    ) -> MamlResult<EpisodeForward> {
        if kind == InputKind::Features {
            return Err(UsageError::PrecomputedFeatures.into());
        }
        self.check_way(batch)?;
        let split = batch.split(self.n_support)?;
        let tape = leaves.tape();

        let support = tape.constant(split.support.clone());
        let adaptation = self.adapter(first_order)?.adapt(
            &self.model,
            leaves,
            &support,
            &split.support_labels(),
            &self.loss_fn,
        )?;

        let query = tape.constant(split.query.clone());
        let scores = self
            .model
            .forward(&query, &WeightView::with_fast(leaves, &adaptation.fast))?;

        Ok(EpisodeForward {
            scores,
            query_labels: split.query_labels(),
            inner_losses: adaptation.support_losses,
            fast: adaptation.fast,
        })
    }

    /// Adapt on the support set and score the query set.
    pub fn set_forward(
        &self,
        session: &TapeSession,
        batch: &EpisodeBatch,
        kind: InputKind,
    ) -> MamlResult<EpisodeForward> {
        self.forward_episode(session.leaves(), batch, kind, self.config.first_order)
    }

    /// Meta-loss (query cross-entropy after adaptation) and the inner losses.
    pub fn set_forward_loss(
        &self,
        session: &TapeSession,
        batch: &EpisodeBatch,
    ) -> MamlResult<EpisodeLoss> {
        let forward = self.set_forward(session, batch, InputKind::Raw)?;
        let loss = self.loss_fn.compute(&forward.scores, &forward.query_labels)?;
        let value = loss.scalar()?;
        if !value.is_finite() {
            return Err(MamlError::Numerical(format!("Meta-loss is {}", value)));
        }
        Ok(EpisodeLoss {
            loss,
            value,
            inner_losses: forward.inner_losses,
        })
    }

    /// Generic further-adaptation hook; always a usage error, adaptation
    /// depth is `task_update_num`.
    pub fn set_forward_adaptation(
        &self,
        _batch: &EpisodeBatch,
        _kind: InputKind,
    ) -> MamlResult<EpisodeForward> {
        Err(UsageError::AdaptationHookUnsupported.into())
    }

    /// Top-1 correct query predictions and query count for one episode.
    ///
    /// Runs on its own tape; inner gradients are detached since nothing
    /// differentiates through them here.
    pub fn correct(&self, batch: &EpisodeBatch) -> MamlResult<(usize, usize)> {
        let session = self.begin_session();
        let forward = self.forward_episode(session.leaves(), batch, InputKind::Raw, true)?;
        let correct = forward
            .scores
            .with_value(|scores| top1_correct(&scores.view(), &forward.query_labels))?;
        Ok((correct, forward.query_labels.len()))
    }

    /// Accumulate d`meta_loss`/d(persistent) into the gradient buffer.
    pub fn backward(&mut self, meta_loss: &Var, leaves: &MetaLeaves) -> MamlResult<()> {
        let targets = leaves.trainable_leaves();
        let grads = grad(meta_loss, &targets, GradOptions::detached())?;
        let mut values = Vec::with_capacity(grads.len());
        for (&id, g) in leaves.trainable_ids().iter().zip(grads) {
            let g = g.value();
            if !g.iter().all(|v| v.is_finite()) {
                return Err(MamlError::Numerical(format!(
                    "Non-finite meta-gradient for parameter {}",
                    id
                )));
            }
            values.push((id, g));
        }
        // all-or-nothing: a rejected gradient leaves the buffer untouched
        for (id, g) in values {
            if let Err(err) = self.grads.accumulate(id, g) {
                self.grads.zero();
                return Err(err);
            }
        }
        Ok(())
    }

    fn outer_step(
        &mut self,
        meta_loss: &Var,
        leaves: &MetaLeaves,
        optimizer: &mut dyn Optimizer,
    ) -> MamlResult<()> {
        self.backward(meta_loss, leaves)?;
        optimizer.step(self.model.parameters_mut(), &self.grads)
    }

    /// One epoch of meta-training.
    ///
    /// Every `n_task` episodes the combined meta-loss is backpropagated and
    /// `optimizer` takes one step. The gradient buffer is cleared on entry,
    /// after every episode and when an outer step fails. Episodes of a
    /// trailing incomplete meta-batch are dropped.
    pub fn train_loop<I>(
        &mut self,
        epoch: usize,
        loader: I,
        optimizer: &mut dyn Optimizer,
    ) -> MamlResult<TrainLoopSummary>
    where
        I: IntoIterator<Item = EpisodeBatch>,
        I::IntoIter: ExactSizeIterator,
    {
        self.n_support = self.config.n_support;
        let episodes = loader.into_iter();
        let len = episodes.len();
        if len == 0 {
            return Err(MamlError::EmptyInput("training loader".to_string()));
        }

        let print_freq = 2 * self.config.n_task;
        let mut accumulator = MetaBatchAccumulator::new(self.config.n_task, self.config.reduction)?;
        let mut summary = TrainLoopSummary {
            epoch,
            ..Default::default()
        };
        let mut total_loss = 0.0;
        self.zero_grad();

        for (i, batch) in episodes.enumerate() {
            let session = accumulator.session(self.model.parameters());
            let episode = self.set_forward_loss(session, &batch)?;
            total_loss += episode.value;
            self.stats.record_task_adaptation(episode.inner_losses.clone());
            summary.inner_losses.push(episode.inner_losses);
            summary.num_items += 1;

            if (i + 1) % print_freq == 0 {
                let line = format!(
                    "Epoch {} | Batch {}/{} | Loss {:.6}",
                    epoch,
                    i,
                    len,
                    total_loss / (i + 1) as f64
                );
                info!("{}", line);
                summary.reports.push(line);
            }

            if accumulator.push(episode.loss)? {
                let (session, meta_loss) = accumulator.take()?;
                let meta_value = meta_loss.scalar()?;
                if let Err(err) = self.outer_step(&meta_loss, session.leaves(), optimizer) {
                    self.zero_grad();
                    return Err(err);
                }
                self.stats.record_meta_step(meta_value);
                summary.outer_steps += 1;
                debug!(
                    step = summary.outer_steps,
                    meta_loss = meta_value,
                    grad_norm = self.grads.norm(),
                    "outer step"
                );
            }

            self.zero_grad();
        }

        summary.discarded = accumulator.discard();
        if summary.discarded > 0 {
            warn!(
                discarded = summary.discarded,
                n_task = self.config.n_task,
                "dropping incomplete meta-batch at end of epoch"
            );
        }
        summary.avg_loss = total_loss / summary.num_items as f64;
        Ok(summary)
    }

    /// Adapt-then-score every test episode and aggregate accuracy.
    ///
    /// Persistent parameters are never modified.
    pub fn test_loop<I>(&mut self, loader: I, return_std: bool) -> MamlResult<AccuracyReport>
    where
        I: IntoIterator<Item = EpisodeBatch>,
    {
        self.n_support = self.config.test_n_support;
        let mut stats = AccuracyStats::new();
        for batch in loader {
            let (correct, total) = self.correct(&batch)?;
            stats.record(correct, total)?;
        }
        if stats.is_empty() {
            return Err(MamlError::EmptyInput("test loader".to_string()));
        }

        let report = stats.report(return_std);
        info!("{}", report.summary);
        Ok(report)
    }
}
