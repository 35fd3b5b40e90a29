//! Search configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything that tunes one search run. Loaded from file/CLI by the binary
/// and echoed verbatim into the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Token budget for every generated sentence.
    pub budget: u32,
    /// Soft minimum sentence length; the derivation prefers choices that
    /// can still reach it but never fails over it.
    pub min_length: u32,
    /// UCB1 exploration constant. Higher means more exploration.
    pub exploration_c: f64,
    /// Visits a node needs before it is expanded.
    pub expansion_threshold: u32,
    /// Lock exhausted nodes out of future selection.
    pub use_locking: bool,
    /// Use the learned weight tables during rollouts.
    pub use_bias: bool,
    /// Runs cheaper than this are glitches and are never backpropagated.
    /// Warmup recalibrates it from observed costs.
    pub min_plausible_cost: u64,
    /// Starting uniqueness-tail length; adapts with the observed cost range.
    pub tail_len: usize,
    /// Cap on the tree-drop uniqueness threshold.
    pub max_threshold: f64,
    /// Exponential decay rate of the tree-drop threshold.
    pub threshold_decay: f64,
    /// Iterations between refreshes of the hot-node shortlist.
    pub hot_refresh_interval: u64,
    /// Size of the hot-node shortlist.
    pub hot_top_n: usize,
    /// Probability of starting an iteration from a hot node instead of
    /// the root.
    pub hot_start_prob: f64,
    /// Unique non-anomalous inputs the warmup phase collects.
    pub warmup_unique_inputs: usize,
    /// Wall-clock cap on the warmup phase, in seconds.
    pub warmup_max_secs: u64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            budget: 60,
            min_length: 0,
            exploration_c: 2.0,
            expansion_threshold: 10,
            use_locking: false,
            use_bias: false,
            min_plausible_cost: 50,
            tail_len: 5_000,
            max_threshold: 0.5,
            threshold_decay: 0.0001,
            hot_refresh_interval: 500,
            hot_top_n: 10,
            hot_start_prob: 0.5,
            warmup_unique_inputs: 20,
            warmup_max_secs: 180,
            seed: 0,
        }
    }
}

impl SearchConfig {
    /// Small, deterministic settings for unit tests.
    pub fn for_testing() -> Self {
        Self {
            budget: 8,
            expansion_threshold: 2,
            tail_len: 50,
            warmup_unique_inputs: 3,
            warmup_max_secs: 5,
            seed: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget == 0 {
            return Err(ConfigError::Invalid("budget must be positive".into()));
        }
        if self.exploration_c <= 0.0 {
            return Err(ConfigError::Invalid(
                "exploration_c must be positive".into(),
            ));
        }
        if self.expansion_threshold == 0 {
            return Err(ConfigError::Invalid(
                "expansion_threshold must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_threshold) {
            return Err(ConfigError::Invalid(
                "max_threshold must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.hot_start_prob) {
            return Err(ConfigError::Invalid(
                "hot_start_prob must be in [0, 1]".into(),
            ));
        }
        if self.threshold_decay < 0.0 {
            return Err(ConfigError::Invalid(
                "threshold_decay must not be negative".into(),
            ));
        }
        if self.tail_len == 0 {
            return Err(ConfigError::Invalid("tail_len must be positive".into()));
        }
        if self.hot_refresh_interval == 0 {
            return Err(ConfigError::Invalid(
                "hot_refresh_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(SearchConfig::default().validate().is_ok());
        assert!(SearchConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut cfg = SearchConfig::default();
        cfg.budget = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SearchConfig::default();
        cfg.exploration_c = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = SearchConfig::default();
        cfg.hot_start_prob = 1.5;
        assert!(cfg.validate().is_err());
    }
}
