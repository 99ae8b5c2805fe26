//! Meta-training history.

/// Statistics tracker for meta-training.
#[derive(Debug, Clone, Default)]
pub struct MetaStats {
    /// Combined meta-loss of every outer step.
    pub meta_losses: Vec<f64>,
    /// Inner support-loss trajectory of every episode, in training order.
    pub task_losses: Vec<Vec<f64>>,
    /// Number of outer steps taken.
    pub iterations: usize,
}

impl MetaStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outer step.
    pub fn record_meta_step(&mut self, meta_loss: f64) {
        self.meta_losses.push(meta_loss);
        self.iterations += 1;
    }

    /// Record one episode's inner losses.
    pub fn record_task_adaptation(&mut self, losses: Vec<f64>) {
        self.task_losses.push(losses);
    }

    /// Average meta-loss over the last `last_n` outer steps.
    pub fn avg_meta_loss(&self, last_n: usize) -> f64 {
        if self.meta_losses.is_empty() || last_n == 0 {
            return 0.0;
        }

        let n = last_n.min(self.meta_losses.len());
        let start = self.meta_losses.len() - n;
        self.meta_losses[start..].iter().sum::<f64>() / n as f64
    }

    /// Whether the last `window` steps average below the `window` before them.
    pub fn is_improving(&self, window: usize) -> bool {
        if window == 0 || self.meta_losses.len() < window * 2 {
            return false;
        }

        let recent = self.avg_meta_loss(window);
        let previous = {
            let start = self.meta_losses.len() - window * 2;
            let end = self.meta_losses.len() - window;
            self.meta_losses[start..end].iter().sum::<f64>() / window as f64
        };

        recent < previous
    }

    /// Mean reduction from first to last inner loss, across recorded episodes.
    pub fn mean_inner_improvement(&self) -> f64 {
        let gains: Vec<f64> = self
            .task_losses
            .iter()
            .filter_map(|losses| Some(losses.first()? - losses.last()?))
            .collect();
        if gains.is_empty() {
            return 0.0;
        }
        gains.iter().sum::<f64>() / gains.len() as f64
    }
}
