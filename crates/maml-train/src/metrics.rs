//! Episode accuracy and its aggregation across test episodes.

use crate::{MamlError, MamlResult};
use scirs2_core::ndarray::ArrayView2;

/// Number of rows whose argmax equals the label.
///
/// Ties resolve to the lowest class index.
pub fn top1_correct(scores: &ArrayView2<f64>, labels: &[usize]) -> MamlResult<usize> {
    if scores.nrows() != labels.len() {
        return Err(MamlError::Shape(format!(
            "Shape mismatch: {} score rows vs {} labels",
            scores.nrows(),
            labels.len()
        )));
    }

    let mut correct = 0;
    for (row, &label) in scores.rows().into_iter().zip(labels) {
        let mut pred_class = 0;
        let mut max_score = f64::NEG_INFINITY;
        for (j, &score) in row.iter().enumerate() {
            if score > max_score {
                max_score = score;
                pred_class = j;
            }
        }
        if pred_class == label {
            correct += 1;
        }
    }
    Ok(correct)
}

/// Per-episode accuracies in percent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccuracyStats {
    accuracies: Vec<f64>,
}

impl AccuracyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_accuracies(accuracies: Vec<f64>) -> Self {
        Self { accuracies }
    }

    /// Record `correct` out of `total` as a percentage.
    pub fn record(&mut self, correct: usize, total: usize) -> MamlResult<f64> {
        if total == 0 {
            return Err(MamlError::EmptyInput("episode without query rows".to_string()));
        }
        let accuracy = correct as f64 / total as f64 * 100.0;
        self.accuracies.push(accuracy);
        Ok(accuracy)
    }

    pub fn accuracies(&self) -> &[f64] {
        &self.accuracies
    }

    /// Number of episodes.
    pub fn len(&self) -> usize {
        self.accuracies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accuracies.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.accuracies.is_empty() {
            return 0.0;
        }
        self.accuracies.iter().sum::<f64>() / self.accuracies.len() as f64
    }

    /// Population standard deviation (divides by M).
    pub fn std(&self) -> f64 {
        if self.accuracies.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .accuracies
            .iter()
            .map(|a| (a - mean).powi(2))
            .sum::<f64>()
            / self.accuracies.len() as f64;
        variance.sqrt()
    }

    /// 95% normal-approximation half-width, `1.96 * std / sqrt(M)`.
    pub fn half_width(&self) -> f64 {
        if self.accuracies.is_empty() {
            return 0.0;
        }
        1.96 * self.std() / (self.accuracies.len() as f64).sqrt()
    }

    /// `"{M} Test Acc = {mean}% +- {half_width}%"`.
    pub fn summary_line(&self) -> String {
        format!(
            "{} Test Acc = {:4.2}% +- {:4.2}%",
            self.len(),
            self.mean(),
            self.half_width()
        )
    }

    /// Freeze into a report, with the std only when asked for.
    pub fn report(&self, return_std: bool) -> AccuracyReport {
        AccuracyReport {
            episodes: self.len(),
            mean: self.mean(),
            std: return_std.then(|| self.std()),
            half_width: self.half_width(),
            summary: self.summary_line(),
        }
    }
}

/// Outcome of a test loop.
#[derive(Debug, Clone, PartialEq)]
pub struct AccuracyReport {
    pub episodes: usize,
    /// Mean accuracy in percent.
    pub mean: f64,
    /// Population std, present when requested.
    pub std: Option<f64>,
    pub half_width: f64,
    /// The logged summary line.
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use scirs2_core::ndarray::array;

    #[test]
    fn test_top1_correct() {
        let scores = array![[0.9, 0.1], [0.2, 0.8], [0.6, 0.4], [0.5, 0.5]];
        assert_eq!(top1_correct(&scores.view(), &[0, 1, 1, 0]).unwrap(), 3);
        assert!(top1_correct(&scores.view(), &[0]).is_err());
    }

    #[test]
    fn test_population_std_and_half_width() {
        let stats = AccuracyStats::from_accuracies(vec![60.0, 80.0, 70.0, 90.0]);
        assert_abs_diff_eq!(stats.mean(), 75.0, epsilon = 1e-12);
        // population variance = (225 + 25 + 25 + 225) / 4 = 125
        assert_abs_diff_eq!(stats.std(), 125.0_f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(
            stats.half_width(),
            1.96 * 125.0_f64.sqrt() / 2.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_summary_line_format() {
        let stats = AccuracyStats::from_accuracies(vec![50.0, 50.0]);
        assert_eq!(stats.summary_line(), "2 Test Acc = 50.00% +- 0.00%");
    }

    #[test]
    fn test_record_and_report() {
        let mut stats = AccuracyStats::new();
        assert_abs_diff_eq!(stats.record(3, 4).unwrap(), 75.0, epsilon = 1e-12);
        stats.record(1, 4).unwrap();
        assert!(stats.record(0, 0).is_err());

        let report = stats.report(true);
        assert_eq!(report.episodes, 2);
        assert_abs_diff_eq!(report.mean, 50.0, epsilon = 1e-12);
        assert_abs_diff_eq!(report.std.unwrap(), 25.0, epsilon = 1e-12);
        assert!(stats.report(false).std.is_none());
    }
}
