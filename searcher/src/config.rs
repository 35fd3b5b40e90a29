//! Configuration for the searcher binary.
//!
//! Values are loaded from treeline.toml with environment variable overrides.
//! CLI arguments take highest priority, followed by env vars, then the file.

use anyhow::{anyhow, Result};
use clap::Parser;
use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

use mcts::{RunLimit, SearchConfig};

use crate::central_config::{load_config, CentralConfig};

// Load central config once at startup
static CENTRAL_CONFIG: Lazy<CentralConfig> = Lazy::new(load_config);

fn default_budget() -> u32 {
    CENTRAL_CONFIG.search.budget
}

fn default_min_length() -> u32 {
    CENTRAL_CONFIG.search.min_length
}

fn default_exploration_c() -> f64 {
    CENTRAL_CONFIG.search.exploration_c
}

fn default_expansion_threshold() -> u32 {
    CENTRAL_CONFIG.search.expansion_threshold
}

fn default_min_plausible_cost() -> u64 {
    CENTRAL_CONFIG.search.min_plausible_cost
}

fn default_tail_len() -> usize {
    CENTRAL_CONFIG.search.tail_len
}

fn default_max_threshold() -> f64 {
    CENTRAL_CONFIG.search.max_threshold
}

fn default_threshold_decay() -> f64 {
    CENTRAL_CONFIG.search.threshold_decay
}

fn default_hot_refresh_interval() -> u64 {
    CENTRAL_CONFIG.search.hot_refresh_interval
}

fn default_hot_top_n() -> usize {
    CENTRAL_CONFIG.search.hot_top_n
}

fn default_hot_start_prob() -> f64 {
    CENTRAL_CONFIG.search.hot_start_prob
}

fn default_warmup_unique_inputs() -> usize {
    CENTRAL_CONFIG.search.warmup_unique_inputs
}

fn default_warmup_max_secs() -> u64 {
    CENTRAL_CONFIG.search.warmup_max_secs
}

fn default_seed() -> u64 {
    CENTRAL_CONFIG.search.seed
}

fn default_iterations() -> u64 {
    CENTRAL_CONFIG.search.iterations
}

fn default_addr() -> String {
    CENTRAL_CONFIG.runner.addr.clone()
}

fn default_out_dir() -> String {
    CENTRAL_CONFIG.output.dir.clone()
}

fn default_log_level() -> String {
    CENTRAL_CONFIG.output.log_level.clone()
}

#[derive(Parser, Debug, Clone)]
#[command(name = "searcher")]
#[command(about = "Grammar-driven search for inputs that are expensive to run")]
#[command(
    long_about = "Derives inputs from a BNF grammar with Monte Carlo tree search,
runs them through the instrumented target, and keeps the ones that set cost
or coverage records.

Configuration is loaded from treeline.toml with environment variable
overrides. CLI arguments take highest priority."
)]
pub struct Config {
    /// Path to the BNF grammar file
    #[arg(long)]
    pub grammar: PathBuf,

    /// Count each literal's cost as its byte length instead of one token
    #[arg(long)]
    pub len_based_cost: bool,

    /// Iterations to run (ignored when --duration-secs is given)
    #[arg(long, default_value_t = default_iterations())]
    pub iterations: u64,

    /// Wall-clock limit in seconds instead of an iteration count
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Token budget for every generated sentence
    #[arg(long, default_value_t = default_budget())]
    pub budget: u32,

    /// Soft minimum sentence length
    #[arg(long, default_value_t = default_min_length())]
    pub min_length: u32,

    /// UCB1 exploration constant
    #[arg(long, default_value_t = default_exploration_c())]
    pub exploration_c: f64,

    /// Visits a node needs before it is expanded
    #[arg(long, default_value_t = default_expansion_threshold())]
    pub expansion_threshold: u32,

    /// Lock exhausted nodes out of future selection
    #[arg(long)]
    pub lock: bool,

    /// Learn choice weights and use them during rollouts
    #[arg(long)]
    pub bias: bool,

    /// Runs cheaper than this count as glitches (warmup recalibrates it)
    #[arg(long, default_value_t = default_min_plausible_cost())]
    pub min_plausible_cost: u64,

    /// Starting uniqueness-tail length
    #[arg(long, default_value_t = default_tail_len())]
    pub tail_len: usize,

    /// Cap on the tree-drop uniqueness threshold
    #[arg(long, default_value_t = default_max_threshold())]
    pub max_threshold: f64,

    /// Exponential decay rate of the tree-drop threshold
    #[arg(long, default_value_t = default_threshold_decay())]
    pub threshold_decay: f64,

    /// Iterations between refreshes of the hot-node shortlist
    #[arg(long, default_value_t = default_hot_refresh_interval())]
    pub hot_refresh_interval: u64,

    /// Size of the hot-node shortlist
    #[arg(long, default_value_t = default_hot_top_n())]
    pub hot_top_n: usize,

    /// Probability of starting an iteration from a hot node
    #[arg(long, default_value_t = default_hot_start_prob())]
    pub hot_start_prob: f64,

    /// Skip the warmup calibration phase
    #[arg(long)]
    pub skip_warmup: bool,

    /// Unique inputs the warmup phase collects
    #[arg(long, default_value_t = default_warmup_unique_inputs())]
    pub warmup_unique_inputs: usize,

    /// Wall-clock cap on the warmup phase, in seconds
    #[arg(long, default_value_t = default_warmup_max_secs())]
    pub warmup_max_secs: u64,

    /// RNG seed
    #[arg(long, default_value_t = default_seed())]
    pub seed: u64,

    /// Address of the target runner
    #[arg(long, default_value_t = default_addr())]
    pub addr: String,

    /// Use the in-process fake runner instead of a TCP connection
    #[arg(long)]
    pub fake: bool,

    /// Seed for the fake runner
    #[arg(long, default_value_t = 0)]
    pub fake_seed: u64,

    /// Output directory for the corpus, report, and bias dump
    #[arg(long, default_value_t = default_out_dir())]
    pub out_dir: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value_t = default_log_level())]
    pub log_level: String,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.log_level.parse::<LevelFilter>().is_err() {
            return Err(anyhow!(
                "invalid log level '{}', expected one of trace, debug, info, warn, error",
                self.log_level
            ));
        }
        if self.duration_secs == Some(0) {
            return Err(anyhow!("duration_secs must be greater than 0"));
        }
        if self.duration_secs.is_none() && self.iterations == 0 {
            return Err(anyhow!("iterations must be greater than 0"));
        }
        if self.out_dir.is_empty() {
            return Err(anyhow!("out_dir cannot be empty"));
        }
        self.search_config().validate()?;
        Ok(())
    }

    /// The file/env/CLI layers flattened into the search tunables. Flags OR
    /// into the file values so `--bias` can only turn features on.
    pub fn search_config(&self) -> SearchConfig {
        SearchConfig {
            budget: self.budget,
            min_length: self.min_length,
            exploration_c: self.exploration_c,
            expansion_threshold: self.expansion_threshold,
            use_locking: self.lock || CENTRAL_CONFIG.search.use_locking,
            use_bias: self.bias || CENTRAL_CONFIG.search.use_bias,
            min_plausible_cost: self.min_plausible_cost,
            tail_len: self.tail_len,
            max_threshold: self.max_threshold,
            threshold_decay: self.threshold_decay,
            hot_refresh_interval: self.hot_refresh_interval,
            hot_top_n: self.hot_top_n,
            hot_start_prob: self.hot_start_prob,
            warmup_unique_inputs: self.warmup_unique_inputs,
            warmup_max_secs: self.warmup_max_secs,
            seed: self.seed,
        }
    }

    pub fn run_limit(&self) -> RunLimit {
        match self.duration_secs {
            Some(secs) => RunLimit::WallClock(Duration::from_secs(secs)),
            None => RunLimit::Iterations(self.iterations),
        }
    }

    pub fn use_fake(&self) -> bool {
        self.fake || CENTRAL_CONFIG.runner.use_fake
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            grammar: "grammars/expr.bnf".into(),
            len_based_cost: false,
            iterations: 1000,
            duration_secs: None,
            budget: 60,
            min_length: 0,
            exploration_c: 2.0,
            expansion_threshold: 10,
            lock: false,
            bias: false,
            min_plausible_cost: 50,
            tail_len: 5_000,
            max_threshold: 0.5,
            threshold_decay: 0.0001,
            hot_refresh_interval: 500,
            hot_top_n: 10,
            hot_start_prob: 0.5,
            skip_warmup: false,
            warmup_unique_inputs: 20,
            warmup_max_secs: 180,
            seed: 0,
            addr: "127.0.0.1:2300".into(),
            fake: false,
            fake_seed: 0,
            out_dir: "./out".into(),
            log_level: "info".into(),
        }
    }

    #[test]
    fn validate_accepts_valid_configuration() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut cfg = base_config();
        cfg.log_level = "nope".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid log level"));
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut cfg = base_config();
        cfg.iterations = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base_config();
        cfg.duration_secs = Some(0);
        assert!(cfg.validate().is_err());

        // A duration makes the iteration count irrelevant.
        let mut cfg = base_config();
        cfg.iterations = 0;
        cfg.duration_secs = Some(30);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_search_tunables() {
        let mut cfg = base_config();
        cfg.budget = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base_config();
        cfg.hot_start_prob = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn run_limit_prefers_duration() {
        let mut cfg = base_config();
        cfg.duration_secs = Some(30);
        assert!(matches!(cfg.run_limit(), RunLimit::WallClock(d) if d.as_secs() == 30));

        cfg.duration_secs = None;
        assert!(matches!(cfg.run_limit(), RunLimit::Iterations(1000)));
    }
}
