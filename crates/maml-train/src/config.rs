//! MAML hyperparameters, loadable from TOML.
//!
//! ```toml
//! n_way = 5
//! n_support = 1
//! task_update_num = 5
//! train_lr = 0.01
//! first_order = true
//! ```
//!
//! Missing keys fall back to [`MamlConfig::default`].

use crate::{MamlError, MamlResult};
use scirs2_core::random::{SeedableRng, StdRng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How the meta-losses of one meta-batch are combined before the backward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaLossReduction {
    /// Raw sum over the `n_task` episodes (effective outer step scales with `n_task`).
    #[default]
    Sum,
    /// Sum divided by `n_task`.
    Mean,
}

/// Configuration of a [`Maml`](crate::Maml) learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MamlConfig {
    /// Classes per episode.
    pub n_way: usize,
    /// Support examples per class during training.
    pub n_support: usize,
    /// Support examples per class during evaluation.
    pub test_n_support: usize,
    /// Episodes per outer optimizer step.
    pub n_task: usize,
    /// Inner-loop gradient steps (K).
    pub task_update_num: usize,
    /// Inner-loop step size.
    pub train_lr: f64,
    /// Detach inner gradients, dropping second-order terms.
    pub first_order: bool,
    /// Meta-loss reduction across a meta-batch.
    pub reduction: MetaLossReduction,
    /// Seed of [`init_rng`](Self::init_rng), used by [`Maml::with_mlp`](crate::Maml::with_mlp)
    /// to draw the initial weights.
    pub seed: u64,
}

impl Default for MamlConfig {
    fn default() -> Self {
        Self {
            n_way: 5,
            n_support: 5,
            test_n_support: 5,
            n_task: 1,
            task_update_num: 5,
            train_lr: 0.01,
            first_order: false,
            reduction: MetaLossReduction::Sum,
            seed: 0,
        }
    }
}

impl MamlConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> MamlResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> MamlResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| MamlError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty TOML.
    pub fn save(&self, path: &Path) -> MamlResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| MamlError::Config(format!("Failed to serialize configuration: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Generator for parameter initialization, seeded from `seed`.
    pub fn init_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// Reject values the algorithm cannot run with.
    pub fn validate(&self) -> MamlResult<()> {
        let counts = [
            ("n_way", self.n_way),
            ("n_support", self.n_support),
            ("test_n_support", self.test_n_support),
            ("n_task", self.n_task),
            ("task_update_num", self.task_update_num),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(MamlError::Config(format!("{} must be at least 1", name)));
            }
        }
        if !self.train_lr.is_finite() || self.train_lr <= 0.0 {
            return Err(MamlError::Config(format!(
                "train_lr must be positive and finite, got {}",
                self.train_lr
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MamlConfig::default();
        assert_eq!(config.n_way, 5);
        assert_eq!(config.task_update_num, 5);
        assert_eq!(config.train_lr, 0.01);
        assert_eq!(config.reduction, MetaLossReduction::Sum);
        assert!(!config.first_order);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = MamlConfig::from_toml_str(
            "n_way = 3\nn_support = 1\nfirst_order = true\nreduction = \"mean\"\n",
        )
        .unwrap();
        assert_eq!(config.n_way, 3);
        assert_eq!(config.n_support, 1);
        assert!(config.first_order);
        assert_eq!(config.reduction, MetaLossReduction::Mean);
        assert_eq!(config.task_update_num, 5);
    }

    #[test]
    fn test_zero_inner_steps_rejected() {
        let err = MamlConfig::from_toml_str("task_update_num = 0").unwrap_err();
        assert!(matches!(err, MamlError::Config(_)));
    }

    #[test]
    fn test_bad_learning_rate_rejected() {
        let config = MamlConfig {
            train_lr: -0.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = MamlConfig {
            train_lr: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("maml_config_{}.toml", std::process::id()));
        let config = MamlConfig {
            n_way: 2,
            seed: 42,
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = MamlConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_toml_roundtrip_through_string() {
        let config = MamlConfig::default();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("reduction = \"sum\""));
        let parsed: MamlConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
