//! Centralized configuration loading from treeline.toml.
//!
//! A single source of truth for tunables, loaded once at startup with
//! environment variable overrides. CLI arguments take highest priority,
//! followed by env vars, then the file.

use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

mod defaults {
    pub const BUDGET: u32 = 60;
    pub const MIN_LENGTH: u32 = 0;
    pub const EXPLORATION_C: f64 = 2.0;
    pub const EXPANSION_THRESHOLD: u32 = 10;
    pub const MIN_PLAUSIBLE_COST: u64 = 50;
    pub const TAIL_LEN: usize = 5_000;
    pub const MAX_THRESHOLD: f64 = 0.5;
    pub const THRESHOLD_DECAY: f64 = 0.0001;
    pub const HOT_REFRESH_INTERVAL: u64 = 500;
    pub const HOT_TOP_N: usize = 10;
    pub const HOT_START_PROB: f64 = 0.5;
    pub const WARMUP_UNIQUE_INPUTS: usize = 20;
    pub const WARMUP_MAX_SECS: u64 = 180;
    pub const SEED: u64 = 0;
    pub const ITERATIONS: u64 = 25_000;
    pub const RUNNER_ADDR: &str = "127.0.0.1:2300";
    pub const OUTPUT_DIR: &str = "./out";
    pub const LOG_LEVEL: &str = "info";
}

/// Root structure matching treeline.toml.
#[derive(Debug, Deserialize, Default)]
pub struct CentralConfig {
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub output: OutputSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub budget: u32,
    pub min_length: u32,
    pub exploration_c: f64,
    pub expansion_threshold: u32,
    pub use_locking: bool,
    pub use_bias: bool,
    pub min_plausible_cost: u64,
    pub tail_len: usize,
    pub max_threshold: f64,
    pub threshold_decay: f64,
    pub hot_refresh_interval: u64,
    pub hot_top_n: usize,
    pub hot_start_prob: f64,
    pub warmup_unique_inputs: usize,
    pub warmup_max_secs: u64,
    pub seed: u64,
    pub iterations: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            budget: defaults::BUDGET,
            min_length: defaults::MIN_LENGTH,
            exploration_c: defaults::EXPLORATION_C,
            expansion_threshold: defaults::EXPANSION_THRESHOLD,
            use_locking: false,
            use_bias: false,
            min_plausible_cost: defaults::MIN_PLAUSIBLE_COST,
            tail_len: defaults::TAIL_LEN,
            max_threshold: defaults::MAX_THRESHOLD,
            threshold_decay: defaults::THRESHOLD_DECAY,
            hot_refresh_interval: defaults::HOT_REFRESH_INTERVAL,
            hot_top_n: defaults::HOT_TOP_N,
            hot_start_prob: defaults::HOT_START_PROB,
            warmup_unique_inputs: defaults::WARMUP_UNIQUE_INPUTS,
            warmup_max_secs: defaults::WARMUP_MAX_SECS,
            seed: defaults::SEED,
            iterations: defaults::ITERATIONS,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    pub addr: String,
    pub use_fake: bool,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            addr: defaults::RUNNER_ADDR.into(),
            use_fake: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub dir: String,
    pub log_level: String,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: defaults::OUTPUT_DIR.into(),
            log_level: defaults::LOG_LEVEL.into(),
        }
    }
}

/// Standard locations to search for treeline.toml.
const CONFIG_SEARCH_PATHS: &[&str] = &["treeline.toml", "../treeline.toml"];

/// Load the central configuration, honoring TREELINE_CONFIG if set.
pub fn load_config() -> CentralConfig {
    if let Ok(path) = std::env::var("TREELINE_CONFIG") {
        let path = PathBuf::from(&path);
        if path.exists() {
            info!("Loading config from TREELINE_CONFIG: {}", path.display());
            return load_from_path(&path);
        }
        warn!(
            "TREELINE_CONFIG={} not found, searching defaults",
            path.display()
        );
    }

    for path_str in CONFIG_SEARCH_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading config from {}", path.display());
            return load_from_path(&path);
        }
    }

    debug!("No treeline.toml found, using built-in defaults");
    apply_env_overrides(CentralConfig::default())
}

fn load_from_path(path: &PathBuf) -> CentralConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => apply_env_overrides(config),
            Err(e) => {
                warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                apply_env_overrides(CentralConfig::default())
            }
        },
        Err(e) => {
            warn!("Failed to read {}: {}, using defaults", path.display(), e);
            apply_env_overrides(CentralConfig::default())
        }
    }
}

macro_rules! env_override {
    // String field
    ($config:expr, $section:ident . $field:ident, $key:expr) => {
        if let Ok(v) = std::env::var($key) {
            $config.$section.$field = v;
        }
    };
    // Parseable field (u32, u64, f64, bool, ...)
    ($config:expr, $section:ident . $field:ident, $key:expr, parse) => {
        if let Ok(v) =
            std::env::var($key).and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent))
        {
            $config.$section.$field = v;
        }
    };
}

fn apply_env_overrides(mut config: CentralConfig) -> CentralConfig {
    env_override!(config, search.budget, "TREELINE_SEARCH_BUDGET", parse);
    env_override!(config, search.min_length, "TREELINE_SEARCH_MIN_LENGTH", parse);
    env_override!(
        config,
        search.exploration_c,
        "TREELINE_SEARCH_EXPLORATION_C",
        parse
    );
    env_override!(
        config,
        search.expansion_threshold,
        "TREELINE_SEARCH_EXPANSION_THRESHOLD",
        parse
    );
    env_override!(config, search.use_locking, "TREELINE_SEARCH_USE_LOCKING", parse);
    env_override!(config, search.use_bias, "TREELINE_SEARCH_USE_BIAS", parse);
    env_override!(
        config,
        search.min_plausible_cost,
        "TREELINE_SEARCH_MIN_PLAUSIBLE_COST",
        parse
    );
    env_override!(config, search.tail_len, "TREELINE_SEARCH_TAIL_LEN", parse);
    env_override!(
        config,
        search.max_threshold,
        "TREELINE_SEARCH_MAX_THRESHOLD",
        parse
    );
    env_override!(
        config,
        search.threshold_decay,
        "TREELINE_SEARCH_THRESHOLD_DECAY",
        parse
    );
    env_override!(
        config,
        search.hot_refresh_interval,
        "TREELINE_SEARCH_HOT_REFRESH_INTERVAL",
        parse
    );
    env_override!(config, search.hot_top_n, "TREELINE_SEARCH_HOT_TOP_N", parse);
    env_override!(
        config,
        search.hot_start_prob,
        "TREELINE_SEARCH_HOT_START_PROB",
        parse
    );
    env_override!(
        config,
        search.warmup_unique_inputs,
        "TREELINE_SEARCH_WARMUP_UNIQUE_INPUTS",
        parse
    );
    env_override!(
        config,
        search.warmup_max_secs,
        "TREELINE_SEARCH_WARMUP_MAX_SECS",
        parse
    );
    env_override!(config, search.seed, "TREELINE_SEARCH_SEED", parse);
    env_override!(config, search.iterations, "TREELINE_SEARCH_ITERATIONS", parse);

    env_override!(config, runner.addr, "TREELINE_RUNNER_ADDR");
    env_override!(config, runner.use_fake, "TREELINE_RUNNER_USE_FAKE", parse);

    env_override!(config, output.dir, "TREELINE_OUTPUT_DIR");
    env_override!(config, output.log_level, "TREELINE_OUTPUT_LOG_LEVEL");

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_constants() {
        let config = CentralConfig::default();
        assert_eq!(config.search.budget, 60);
        assert_eq!(config.search.tail_len, 5_000);
        assert_eq!(config.runner.addr, "127.0.0.1:2300");
        assert_eq!(config.output.log_level, "info");
        assert!(!config.search.use_bias);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("TREELINE_SEARCH_BUDGET", "99");
        std::env::set_var("TREELINE_RUNNER_ADDR", "10.0.0.7:4500");

        let config = load_config();
        assert_eq!(config.search.budget, 99);
        assert_eq!(config.runner.addr, "10.0.0.7:4500");

        std::env::remove_var("TREELINE_SEARCH_BUDGET");
        std::env::remove_var("TREELINE_RUNNER_ADDR");
    }

    #[test]
    fn partial_toml_keeps_defaults_elsewhere() {
        let toml_content = r#"
[search]
budget = 120
use_bias = true

[output]
dir = "/tmp/runs"
"#;
        let config: CentralConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.search.budget, 120);
        assert!(config.search.use_bias);
        assert_eq!(config.search.tail_len, 5_000);
        assert_eq!(config.output.dir, "/tmp/runs");
        assert_eq!(config.output.log_level, "info");
    }
}
