//! The search driver: selection, rollout, expansion, backpropagation, tree
//! drops, and run reporting.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use grammar::{Bias, BiasConfig, Grammar, GrammarError};

use crate::config::SearchConfig;
use crate::exec::{CorpusSink, Executor, ExecutorError, Interesting, RunFeedback, RunKind};
use crate::node::NodeId;
use crate::reward::{uniqueness_fraction, EpsilonGreedy, RewardState};
use crate::tree::SearchTree;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Grammar(#[from] GrammarError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("failed to persist an interesting input: {0}")]
    Corpus(#[from] std::io::Error),

    #[error("warmup failed: {0}")]
    Warmup(String),
}

/// How long to search.
#[derive(Debug, Clone, Copy)]
pub enum RunLimit {
    Iterations(u64),
    WallClock(Duration),
}

/// Per-tree progress, frozen when the tree is dropped.
#[derive(Debug, Clone, Serialize)]
pub struct TreeStats {
    pub rollouts: u64,
    pub expansions: u64,
    pub edges: u64,
    pub hot_nodes: usize,
    pub iterations: u64,
}

/// What warmup calibration found.
#[derive(Debug, Clone, Serialize)]
pub struct WarmupSummary {
    pub unique_inputs: usize,
    pub average_cost: f64,
    /// Cost of the root's own (usually empty) input.
    pub baseline_cost: u64,
    pub min_plausible_cost: u64,
}

/// End-of-run report, serialized to JSON by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub config: SearchConfig,
    pub iterations: u64,
    pub duration_ms: u64,
    pub trees: Vec<TreeStats>,
    pub total_rollouts: u64,
    pub total_expansions: u64,
    pub total_edges: u64,
    pub max_cost: u64,
    pub max_hotspot: u32,
    pub anomalous_runs: u64,
    pub final_tail_len: usize,
    pub final_len_weight: f64,
    pub warmup: Option<WarmupSummary>,
}

/// Live numbers for a progress display.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub iteration: u64,
    pub tree_number: u32,
    pub rollouts: u64,
    pub expansions: u64,
    pub edges: u64,
    pub hot_nodes: usize,
    pub max_cost: u64,
    pub tail_len: usize,
    pub uniqueness: f64,
    pub drop_threshold: f64,
    pub len_weight: f64,
}

/// Grammar-driven Monte Carlo tree search for expensive inputs.
pub struct Search<'g, E, S> {
    gram: &'g Grammar,
    cfg: SearchConfig,
    tree: SearchTree,
    reward: RewardState,
    epsilon: EpsilonGreedy,
    rng: ChaCha20Rng,
    executor: E,
    sink: S,

    /// Non-terminal nodes that produced coverage or cost news. Current tree
    /// only; cleared on every drop since the ids would dangle.
    hot_nodes: Vec<NodeId>,
    top_hot: Vec<NodeId>,

    /// Non-anomalous costs across all trees, for the uniqueness tail.
    costs: Vec<u64>,
    exec_since_reset: u64,
    anomalous_runs: u64,
    min_plausible_cost: u64,
    tree_number: u32,

    rollouts: u64,
    expansions: u64,
    edges: u64,
    finished_trees: Vec<TreeStats>,
    total_rollouts: u64,
    total_expansions: u64,
    total_edges: u64,
    iterations: u64,
    started: Instant,
    warmup_summary: Option<WarmupSummary>,
}

impl<'g, E: Executor, S: CorpusSink> Search<'g, E, S> {
    pub fn new(
        gram: &'g Grammar,
        cfg: SearchConfig,
        executor: E,
        sink: S,
    ) -> Result<Self, SearchError> {
        let bias = Bias::new(BiasConfig::default())?;
        let tree = SearchTree::new(
            gram,
            cfg.budget,
            cfg.min_length,
            bias,
            cfg.exploration_c,
            cfg.expansion_threshold,
            cfg.use_locking,
        )?;
        let reward = RewardState::new(cfg.budget, cfg.tail_len);
        let epsilon = EpsilonGreedy::new(1.0, 1.0 - cfg.max_threshold, cfg.threshold_decay);
        let rng = ChaCha20Rng::seed_from_u64(cfg.seed);
        let min_plausible_cost = cfg.min_plausible_cost;
        Ok(Self {
            gram,
            cfg,
            tree,
            reward,
            epsilon,
            rng,
            executor,
            sink,
            hot_nodes: Vec::new(),
            top_hot: Vec::new(),
            costs: Vec::new(),
            exec_since_reset: 0,
            anomalous_runs: 0,
            min_plausible_cost,
            tree_number: 1,
            rollouts: 0,
            expansions: 0,
            edges: 0,
            finished_trees: Vec::new(),
            total_rollouts: 0,
            total_expansions: 0,
            total_edges: 0,
            iterations: 0,
            started: Instant::now(),
            warmup_summary: None,
        })
    }

    pub fn max_observed_cost(&self) -> u64 {
        self.reward.max_observed_cost
    }

    /// Rendering of the learned weight tables, for the end-of-run dump.
    pub fn bias_table(&self) -> String {
        let root = self.tree.root();
        let core = self.tree.node(root).bias.core();
        let table = core.borrow().dump(self.gram);
        table
    }

    /// Calibrate against the target: collect unique random inputs, seed the
    /// cost digest with them, probe the root's input as the cost floor, and
    /// derive the anomaly threshold from the average.
    pub fn warm_up(&mut self) -> Result<WarmupSummary, SearchError> {
        let wanted = self.cfg.warmup_unique_inputs;
        let deadline = Instant::now() + Duration::from_secs(self.cfg.warmup_max_secs);
        let mut unique: HashMap<String, u64> = HashMap::new();

        while unique.len() < wanted {
            let root = self.tree.root();
            let (text, feedback, anomalous, _tokens) = self.rollout_from(root, RunKind::Warmup)?;
            if !anomalous {
                unique.entry(text).or_insert(feedback.cost);
            }
            if Instant::now() > deadline {
                return Err(SearchError::Warmup(format!(
                    "could not find {wanted} unique inputs within {}s",
                    self.cfg.warmup_max_secs
                )));
            }
        }

        let total: u64 = unique.values().sum();
        let average = total as f64 / wanted as f64;
        for &cost in unique.values() {
            self.reward.observe_warmup_cost(cost);
        }

        // The root's input is the cheapest thing the grammar can say; its
        // cost anchors the bottom of the observed range.
        let baseline_input = self.tree.node(self.tree.root()).derivation.text().to_string();
        let baseline = self.executor.run_input(&baseline_input, RunKind::Warmup)?;
        self.reward.min_observed_cost = baseline.cost;

        // Anything under a fifth of the warmup average is a glitch.
        self.min_plausible_cost = (average * 0.2) as u64;
        let summary = WarmupSummary {
            unique_inputs: wanted,
            average_cost: average,
            baseline_cost: baseline.cost,
            min_plausible_cost: self.min_plausible_cost,
        };
        self.reward.average_cost = average;
        info!(
            average_cost = average,
            baseline_cost = baseline.cost,
            min_plausible_cost = self.min_plausible_cost,
            "warmup complete"
        );
        self.warmup_summary = Some(summary.clone());
        Ok(summary)
    }

    /// Run until the limit, invoking `tick` after every iteration.
    pub fn run(
        &mut self,
        limit: RunLimit,
        mut tick: impl FnMut(&Progress),
    ) -> Result<RunReport, SearchError> {
        self.started = Instant::now();
        let mut i = 0u64;
        loop {
            i += 1;
            self.step(i)?;
            self.iterations = i;
            tick(&self.progress(i));
            let done = match limit {
                RunLimit::Iterations(n) => i >= n,
                RunLimit::WallClock(d) => self.started.elapsed() >= d,
            };
            if done {
                break;
            }
        }
        info!(
            iterations = i,
            max_cost = self.reward.max_observed_cost,
            "search finished"
        );
        Ok(self.report())
    }

    /// One full iteration: pick a start node, descend by UCB1, then run,
    /// credit, persist, and maybe drop the tree.
    fn step(&mut self, iteration: u64) -> Result<(), SearchError> {
        let mut current = self.tree.root();

        if iteration % self.cfg.hot_refresh_interval == 0 {
            self.refresh_top_hot();
        }
        if !self.top_hot.is_empty() && self.rng.gen::<f64>() < self.cfg.hot_start_prob {
            if let Some(&best) = self
                .top_hot
                .iter()
                .max_by(|&&a, &&b| self.tree.ucb1(a).total_cmp(&self.tree.ucb1(b)))
            {
                current = best;
            }
        }

        current = self.tree.select_leaf(current);

        let (text, feedback, anomalous, tokens_used) = if self.tree.node(current).is_terminal() {
            self.run_terminal(current)?
        } else if self.tree.is_new(current) {
            self.rollouts += 1;
            self.rollout_from(current, RunKind::Normal)?
        } else {
            let added = self.tree.populate_children(self.gram, current)?;
            self.edges += added as u64;
            self.expansions += 1;
            current = self.tree.node(current).children[0];
            self.rollouts += 1;
            self.rollout_from(current, RunKind::Normal)?
        };

        // Coverage news marks the node even when the run was anomalous.
        if feedback.hnb != 0 {
            self.tree.node_mut(current).hnb = feedback.hnb;
        }
        if feedback.hnm {
            self.tree.node_mut(current).hnm = true;
        }
        if self.reward.has_new_hotspot(feedback.hotspot) {
            self.tree.node_mut(current).hotspot = feedback.hotspot;
        }
        let new_cost = self.reward.has_new_cost(feedback.cost);

        let interesting = feedback.coverage_news() || new_cost;
        if interesting
            && !self.tree.node(current).is_terminal()
            && !self.hot_nodes.contains(&current)
        {
            self.hot_nodes.push(current);
        }

        if anomalous {
            self.anomalous_runs += 1;
        } else {
            self.exec_since_reset += 1;
            let reward = self
                .reward
                .reward(feedback.cost, tokens_used, self.tree_number == 1);
            self.tree.backpropagate(current, reward);
            self.costs.push(feedback.cost);
            debug!(
                iteration,
                cost = feedback.cost,
                hnb = feedback.hnb,
                hnm = feedback.hnm,
                hotspot = feedback.hotspot,
                reward,
                len = text.len(),
                "run"
            );
        }

        if interesting {
            let entry = Interesting {
                input: &text,
                cost: feedback.cost,
                hotspot: feedback.hotspot,
                hnb: feedback.hnb,
                iteration,
                tokens_used,
                elapsed_ms: self.started.elapsed().as_millis() as u64,
                new_coverage: feedback.hnb != 0,
                new_max_hit: feedback.hnm,
                new_cost,
            };
            self.sink.record(&entry)?;
        }

        if self.exec_since_reset >= self.reward.tail_len as u64 && self.has_stabilized() {
            self.reset()?;
        }
        if self.reward.force_reset {
            self.reward.force_reset = false;
            self.reset()?;
        }
        Ok(())
    }

    /// Execute the finished input a terminal node carries.
    fn run_terminal(
        &mut self,
        id: NodeId,
    ) -> Result<(String, RunFeedback, bool, u32), SearchError> {
        let (text, tokens_used) = {
            let node = self.tree.node(id);
            node.derivation.check_budget()?;
            (node.derivation.text().to_string(), node.derivation.tokens_used())
        };
        let feedback = self.executor.run_input(&text, RunKind::Normal)?;
        let anomalous = self.note_if_anomalous(&text, feedback.cost);

        if self.cfg.use_bias {
            let hit = feedback.cost > self.reward.max_observed_cost || feedback.coverage_news();
            let bias = &mut self.tree.node_mut(id).bias;
            if hit {
                bias.reward();
            } else {
                bias.penalize();
            }
        }
        if self.cfg.use_locking && !anomalous {
            self.tree.node_mut(id).locked = true;
        }
        Ok((text, feedback, anomalous, tokens_used))
    }

    /// Complete the node's derivation without touching the tree, run the
    /// result, and feed the outcome back into the shared bias tables.
    fn rollout_from(
        &mut self,
        id: NodeId,
        kind: RunKind,
    ) -> Result<(String, RunFeedback, bool, u32), SearchError> {
        let (derivation, mut fork) = {
            let node = self.tree.node(id);
            (node.derivation.clone(), node.bias.fork())
        };
        let done = if self.cfg.use_bias {
            derivation.rollout(self.gram, &mut self.rng, Some(&mut fork))?
        } else {
            derivation.rollout(self.gram, &mut self.rng, None)?
        };
        let feedback = self.executor.run_input(done.text(), kind)?;
        let anomalous = self.note_if_anomalous(done.text(), feedback.cost);

        if self.cfg.use_bias {
            if feedback.cost > self.reward.max_observed_cost || feedback.coverage_news() {
                fork.reward();
            } else {
                fork.penalize();
            }
        }
        Ok((
            done.text().to_string(),
            feedback,
            anomalous,
            done.tokens_used(),
        ))
    }

    fn note_if_anomalous(&self, input: &str, cost: u64) -> bool {
        if cost < self.min_plausible_cost {
            warn!(cost, threshold = self.min_plausible_cost, input, "anomalous run");
            true
        } else {
            false
        }
    }

    fn refresh_top_hot(&mut self) {
        let mut scored: Vec<NodeId> = self.hot_nodes.clone();
        scored.sort_by(|&a, &b| self.tree.ucb1(b).total_cmp(&self.tree.ucb1(a)));
        scored.truncate(self.cfg.hot_top_n);
        self.top_hot = scored;
    }

    fn uniqueness(&self) -> f64 {
        let tail = self.reward.tail_len;
        if self.costs.len() < tail {
            return 1.0;
        }
        uniqueness_fraction(&self.costs[self.costs.len() - tail..])
    }

    /// Costs have stopped being new: most of the recent tail repeats values
    /// we already saw, compared against the decayed drop threshold.
    fn has_stabilized(&self) -> bool {
        self.uniqueness() < 1.0 - self.epsilon.exploration_rate(self.exec_since_reset)
    }

    /// Drop the tree and rebuild the root. The bias core survives so the
    /// next tree starts with everything learned so far.
    fn reset(&mut self) -> Result<(), SearchError> {
        info!(
            tree = self.tree_number,
            nodes = self.tree.len(),
            rollouts = self.rollouts,
            expansions = self.expansions,
            "dropping stabilized tree"
        );
        self.finish_tree_stats();

        let core = self.tree.node(self.tree.root()).bias.core();
        self.tree = SearchTree::new(
            self.gram,
            self.cfg.budget,
            self.cfg.min_length,
            Bias::with_core(core),
            self.cfg.exploration_c,
            self.cfg.expansion_threshold,
            self.cfg.use_locking,
        )?;
        self.hot_nodes.clear();
        self.top_hot.clear();

        if self.tree_number == 1 {
            self.reward.settle_len_weight(self.exec_since_reset);
            info!(len_weight = self.reward.len_weight, "length reward weight settled");
        }
        self.reward.execs_since_new_max = 0;
        self.reward.observed_new_cost = false;
        self.exec_since_reset = 0;
        self.tree_number += 1;
        Ok(())
    }

    fn finish_tree_stats(&mut self) {
        self.total_rollouts += self.rollouts;
        self.total_expansions += self.expansions;
        self.total_edges += self.edges;
        self.finished_trees.push(TreeStats {
            rollouts: self.rollouts,
            expansions: self.expansions,
            edges: self.edges,
            hot_nodes: self.hot_nodes.len(),
            iterations: self.exec_since_reset,
        });
        self.rollouts = 0;
        self.expansions = 0;
        self.edges = 0;
    }

    fn progress(&self, iteration: u64) -> Progress {
        Progress {
            iteration,
            tree_number: self.tree_number,
            rollouts: self.rollouts,
            expansions: self.expansions,
            edges: self.edges,
            hot_nodes: self.hot_nodes.len(),
            max_cost: self.reward.max_observed_cost,
            tail_len: self.reward.tail_len,
            uniqueness: self.uniqueness(),
            drop_threshold: 1.0 - self.epsilon.exploration_rate(self.exec_since_reset),
            len_weight: self.reward.len_weight,
        }
    }

    /// Snapshot the run so far, including the live tree's partial stats.
    pub fn report(&self) -> RunReport {
        let mut trees = self.finished_trees.clone();
        trees.push(TreeStats {
            rollouts: self.rollouts,
            expansions: self.expansions,
            edges: self.edges,
            hot_nodes: self.hot_nodes.len(),
            iterations: self.exec_since_reset,
        });
        RunReport {
            config: self.cfg.clone(),
            iterations: self.iterations,
            duration_ms: self.started.elapsed().as_millis() as u64,
            trees,
            total_rollouts: self.total_rollouts + self.rollouts,
            total_expansions: self.total_expansions + self.expansions,
            total_edges: self.total_edges + self.edges,
            max_cost: self.reward.max_observed_cost,
            max_hotspot: self.reward.max_observed_hotspot,
            anomalous_runs: self.anomalous_runs,
            final_tail_len: self.reward.tail_len,
            final_len_weight: self.reward.len_weight,
            warmup: self.warmup_summary.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::NullSink;

    /// Cost grows with input length, plus deterministic noise; coverage
    /// news whenever a new length shows up.
    struct LengthExecutor {
        seen: std::collections::HashSet<usize>,
        runs: u64,
    }

    impl LengthExecutor {
        fn new() -> Self {
            Self {
                seen: std::collections::HashSet::new(),
                runs: 0,
            }
        }
    }

    impl Executor for LengthExecutor {
        fn run_input(&mut self, input: &str, _kind: RunKind) -> Result<RunFeedback, ExecutorError> {
            self.runs += 1;
            let novel = self.seen.insert(input.len());
            Ok(RunFeedback {
                cost: 100 + (input.len() as u64) * 17 + self.runs % 3,
                hnb: u8::from(novel),
                hnm: false,
                hotspot: input.len() as u32,
            })
        }
    }

    /// S ::= 'a' S | 'b'
    fn tail_recursive() -> Grammar {
        let mut g = Grammar::new("tail", false);
        let s = g.symbol("S");
        let a = g.literal("a");
        let rec = g.seq(vec![a, s]);
        let b = g.literal("b");
        let alt = g.alt(vec![rec, b]);
        g.add_production(s, alt);
        g.finalize().unwrap();
        g
    }

    fn search(gram: &Grammar, cfg: SearchConfig) -> Search<'_, LengthExecutor, NullSink> {
        Search::new(gram, cfg, LengthExecutor::new(), NullSink).unwrap()
    }

    #[test]
    fn a_short_run_finds_the_most_expensive_input() {
        let g = tail_recursive();
        let mut cfg = SearchConfig::for_testing();
        cfg.min_plausible_cost = 0;
        let mut s = search(&g, cfg);
        let report = s.run(RunLimit::Iterations(1000), |_| {}).unwrap();
        // Budget 8: the longest sentence is "aaaaaaab", cost 100 + 8*17
        // plus noise at most 2.
        assert!(report.max_cost >= 100 + 8 * 17);
        assert!(report.max_cost <= 100 + 8 * 17 + 2);
        assert_eq!(report.iterations, 1000);
        assert!(report.total_rollouts > 0);
        assert_eq!(report.anomalous_runs, 0);
    }

    #[test]
    fn expansion_waits_for_the_visit_threshold() {
        let g = tail_recursive();
        let mut cfg = SearchConfig::for_testing();
        cfg.min_plausible_cost = 0;
        cfg.expansion_threshold = 5;
        let mut s = search(&g, cfg);
        // Five iterations leave the root with five visits, all rollouts:
        // a node is still "new" until it reaches the threshold.
        s.run(RunLimit::Iterations(5), |_| {}).unwrap();
        assert_eq!(s.tree.len(), 1);
        // The next visit finds the root no longer new and expands it.
        s.step(6).unwrap();
        assert!(s.tree.len() > 1);
    }

    #[test]
    fn anomalous_runs_are_counted_but_never_credited() {
        struct GlitchExecutor;
        impl Executor for GlitchExecutor {
            fn run_input(
                &mut self,
                _input: &str,
                _kind: RunKind,
            ) -> Result<RunFeedback, ExecutorError> {
                Ok(RunFeedback {
                    cost: 1,
                    hnb: 0,
                    hnm: false,
                    hotspot: 0,
                })
            }
        }
        let g = tail_recursive();
        let mut cfg = SearchConfig::for_testing();
        cfg.min_plausible_cost = 50;
        let mut s = Search::new(&g, cfg, GlitchExecutor, NullSink).unwrap();
        let report = s.run(RunLimit::Iterations(20), |_| {}).unwrap();
        assert_eq!(report.anomalous_runs, 20);
        // No visit was ever credited to the root.
        let root = s.tree.root();
        assert_eq!(s.tree.node(root).visits, 0);
    }

    #[test]
    fn warmup_calibrates_the_anomaly_threshold() {
        let g = tail_recursive();
        let mut cfg = SearchConfig::for_testing();
        cfg.min_plausible_cost = 0;
        let mut s = search(&g, cfg);
        let summary = s.warm_up().unwrap();
        assert!(summary.average_cost > 0.0);
        assert_eq!(
            summary.min_plausible_cost,
            (summary.average_cost * 0.2) as u64
        );
        assert_eq!(s.min_plausible_cost, summary.min_plausible_cost);
    }

    #[test]
    fn interesting_runs_reach_the_corpus_sink() {
        #[derive(Default)]
        struct CountingSink {
            entries: Vec<(String, u64)>,
        }
        impl CorpusSink for CountingSink {
            fn record(&mut self, entry: &Interesting<'_>) -> std::io::Result<()> {
                self.entries.push((entry.input.to_string(), entry.cost));
                Ok(())
            }
        }
        let g = tail_recursive();
        let mut cfg = SearchConfig::for_testing();
        cfg.min_plausible_cost = 0;
        let mut s =
            Search::new(&g, cfg, LengthExecutor::new(), CountingSink::default()).unwrap();
        s.run(RunLimit::Iterations(100), |_| {}).unwrap();
        assert!(!s.sink.entries.is_empty());
        // The very first run is always a new max cost.
        assert_eq!(s.sink.entries[0].1, s.costs[0]);
    }

    #[test]
    fn stabilized_costs_drop_the_tree_but_keep_the_bias_core() {
        struct ConstantExecutor;
        impl Executor for ConstantExecutor {
            fn run_input(
                &mut self,
                _input: &str,
                _kind: RunKind,
            ) -> Result<RunFeedback, ExecutorError> {
                Ok(RunFeedback {
                    cost: 777,
                    hnb: 0,
                    hnm: false,
                    hotspot: 1,
                })
            }
        }
        let g = tail_recursive();
        let mut cfg = SearchConfig::for_testing();
        cfg.min_plausible_cost = 0;
        cfg.tail_len = 20;
        cfg.use_bias = true;
        // Fast decay so the drop threshold is meaningful quickly.
        cfg.threshold_decay = 0.5;
        let mut s = Search::new(&g, cfg, ConstantExecutor, NullSink).unwrap();
        s.run(RunLimit::Iterations(60), |_| {}).unwrap();
        // Constant costs have uniqueness 1/20 < threshold: must have reset.
        assert!(s.tree_number > 1, "tree was never dropped");
        assert!(!s.finished_trees.is_empty());
        // The replacement tree is fresh.
        assert!(s.exec_since_reset < 60);
    }

    #[test]
    fn hot_node_shortlist_only_holds_nonterminal_news_makers() {
        let g = tail_recursive();
        let mut cfg = SearchConfig::for_testing();
        cfg.min_plausible_cost = 0;
        let mut s = search(&g, cfg);
        s.run(RunLimit::Iterations(200), |_| {}).unwrap();
        for &id in &s.hot_nodes {
            assert!(!s.tree.node(id).is_terminal());
        }
    }

    #[test]
    fn report_echoes_the_configuration() {
        let g = tail_recursive();
        let mut cfg = SearchConfig::for_testing();
        cfg.min_plausible_cost = 0;
        let mut s = search(&g, cfg.clone());
        let report = s.run(RunLimit::Iterations(10), |_| {}).unwrap();
        assert_eq!(report.config.budget, cfg.budget);
        assert_eq!(report.config.expansion_threshold, cfg.expansion_threshold);
        assert_eq!(report.trees.len(), 1);
        assert_eq!(report.trees[0].iterations, 10);
    }
}
