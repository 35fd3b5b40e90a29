//! Searcher - grammar-driven search for expensive inputs
//!
//! A batch process that:
//! 1. Loads a BNF grammar and finalizes its token-cost tables
//! 2. Connects to the instrumented target runner (or an in-process fake)
//! 3. Runs warmup calibration, then the Monte Carlo tree search loop
//! 4. Saves record-setting inputs to `<out>/corpus/` and the run report
//!    to `<out>/report.json`

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

mod central_config;
mod config;

use grammar::{parse_bnf, Grammar};
use mcts::{Executor, Progress, RunLimit, Search};
use runner::{CorpusStore, FakeExecutor, TcpExecutor};

use crate::config::Config;

fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    Ok(())
}

fn main() -> Result<()> {
    let config = Config::parse();
    config.validate()?;
    init_tracing(&config.log_level)?;
    info!(log_level = %config.log_level, "Tracing initialized");

    let src = fs::read_to_string(&config.grammar)
        .with_context(|| format!("failed to read grammar file {}", config.grammar.display()))?;
    let name = config
        .grammar
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "grammar".into());
    let gram = parse_bnf(&src, &name, config.len_based_cost)
        .with_context(|| format!("failed to load grammar {}", config.grammar.display()))?;
    info!(grammar = %config.grammar.display(), "grammar loaded");

    let out_dir = Path::new(&config.out_dir);
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create output directory {}", out_dir.display()))?;
    let sink = CorpusStore::create(out_dir.join("corpus"))?;

    if config.use_fake() {
        info!(seed = config.fake_seed, "using the in-process fake runner");
        run_search(&gram, &config, FakeExecutor::new(config.fake_seed), sink)
    } else {
        let executor = TcpExecutor::connect(config.addr.clone())
            .with_context(|| format!("cannot reach the target runner at {}", config.addr))?;
        run_search(&gram, &config, executor, sink)
    }
}

fn run_search<E: Executor>(
    gram: &Grammar,
    config: &Config,
    executor: E,
    sink: CorpusStore,
) -> Result<()> {
    let mut search = Search::new(gram, config.search_config(), executor, sink)?;

    if config.skip_warmup {
        info!("skipping warmup calibration");
    } else {
        search
            .warm_up()
            .context("warmup calibration failed; is the target runner healthy?")?;
    }

    let limit = config.run_limit();
    let bar = progress_bar(limit)?;
    let report = search.run(limit, |p: &Progress| {
        bar.set_position(p.iteration);
        bar.set_message(format!(
            "max {} tree {} uniq {:.2}",
            p.max_cost, p.tree_number, p.uniqueness
        ));
    })?;
    bar.finish_and_clear();

    let out_dir = Path::new(&config.out_dir);
    let report_path = out_dir.join("report.json");
    fs::write(&report_path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("failed to write {}", report_path.display()))?;

    if report.config.use_bias {
        let bias_path = out_dir.join("bias.txt");
        fs::write(&bias_path, search.bias_table())
            .with_context(|| format!("failed to write {}", bias_path.display()))?;
    }

    info!(
        iterations = report.iterations,
        max_cost = report.max_cost,
        max_hotspot = report.max_hotspot,
        trees = report.trees.len(),
        anomalous_runs = report.anomalous_runs,
        report = %report_path.display(),
        "search complete"
    );
    Ok(())
}

fn progress_bar(limit: RunLimit) -> Result<ProgressBar> {
    let bar = match limit {
        RunLimit::Iterations(n) => {
            let bar = ProgressBar::new(n);
            bar.set_style(ProgressStyle::with_template(
                "{bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}] {msg}",
            )?);
            bar
        }
        RunLimit::WallClock(_) => {
            let bar = ProgressBar::new_spinner();
            bar.set_style(ProgressStyle::with_template(
                "{spinner} iter {pos} [{elapsed_precise}] {msg}",
            )?);
            bar
        }
    };
    Ok(bar)
}
