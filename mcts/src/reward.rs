//! Reward shaping and tree-drop heuristics.
//!
//! The reward for a run blends the cost's quantile among all observed costs
//! with how much of the length budget the input used. The blend weight
//! adapts during the first tree; if adaptation keeps hitting its ceiling the
//! reward permanently switches to quantile-plus-raw-length. The same module
//! owns the uniqueness-tail machinery that decides when a tree has gone
//! stale and should be dropped.

use crate::digest::Digest;

/// Cost-range buckets and the uniqueness-tail length for each. A wider
/// observed cost range means costs repeat less, so the tail shrinks.
const RANGE_BUCKETS: [u64; 5] = [500, 1_000, 100_000, 1_000_000, 1_000_000_000];
const TAIL_LENGTHS: [usize; 6] = [200_000, 100_000, 50_000, 25_000, 5_000, 2_500];

/// Tail length for an observed cost range.
pub fn tail_for_range(range: u64) -> usize {
    let idx = RANGE_BUCKETS.iter().filter(|&&b| range >= b).count();
    TAIL_LENGTHS[idx]
}

/// Linear rescale of `x` from `[min_x, max_x]` to `[lo, hi]`.
pub fn scale_to_range(x: f64, max_x: f64, min_x: f64, lo: f64, hi: f64) -> f64 {
    (hi - lo) * (x - min_x) / (max_x - min_x) + lo
}

/// Fraction of `data` at or above `threshold`.
fn fraction_at_or_above(data: &[u32], threshold: u32) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().filter(|&&v| v >= threshold).count() as f64 / data.len() as f64
}

/// Fraction of distinct values in `data`.
pub fn uniqueness_fraction(data: &[u64]) -> f64 {
    if data.is_empty() {
        return 1.0;
    }
    let mut sorted = data.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.len() as f64 / data.len() as f64
}

/// Exponentially decaying exploration rate.
#[derive(Debug, Clone, Copy)]
pub struct EpsilonGreedy {
    max_rate: f64,
    min_rate: f64,
    decay: f64,
}

impl EpsilonGreedy {
    pub fn new(max_rate: f64, min_rate: f64, decay: f64) -> Self {
        Self {
            max_rate,
            min_rate,
            decay,
        }
    }

    pub fn exploration_rate(&self, steps: u64) -> f64 {
        self.min_rate + (self.max_rate - self.min_rate) * (-self.decay * steps as f64).exp()
    }
}

const LEN_WINDOW: usize = 100;
const LEN_NUDGE: f64 = 0.0001;

/// Cost statistics and reward computation, shared by every tree in a run.
#[derive(Debug)]
pub struct RewardState {
    digest: Digest,
    budget: u32,
    pub max_observed_cost: u64,
    pub min_observed_cost: u64,
    pub max_observed_hotspot: u32,
    pub execs_since_new_max: u64,
    pub observed_new_cost: bool,
    /// Multiplier on the quantile term: 100 when the observed cost range is
    /// narrow relative to the minimum, 1 otherwise.
    pub reward_scale: f64,
    pub tail_len: usize,
    /// Average cost found by warmup.
    pub average_cost: f64,

    // Length-weight adaptation, active only during the first tree.
    len_buffer: Vec<u32>,
    pub len_weight: f64,
    skipped: u64,
    pub raw_len_reward: bool,
    /// Set when adaptation gives up and switches to raw length; the driver
    /// must drop the tree and clear the flag.
    pub force_reset: bool,
    weight_total: f64,
}

impl RewardState {
    pub fn new(budget: u32, tail_len: usize) -> Self {
        Self {
            digest: Digest::default(),
            budget,
            max_observed_cost: 0,
            min_observed_cost: 0,
            max_observed_hotspot: 0,
            execs_since_new_max: 0,
            observed_new_cost: false,
            reward_scale: 1.0,
            tail_len,
            average_cost: 0.0,
            len_buffer: Vec::with_capacity(LEN_WINDOW),
            len_weight: 0.0,
            skipped: 0,
            raw_len_reward: false,
            force_reset: false,
            weight_total: 0.0,
        }
    }

    /// Seed the digest with a warmup cost.
    pub fn observe_warmup_cost(&mut self, cost: u64) {
        self.digest.update(cost as f64);
    }

    /// Record a new maximum cost if `cost` is one. Adjusts the tail length
    /// and the reward scale whenever the known range moves.
    pub fn has_new_cost(&mut self, cost: u64) -> bool {
        if cost > self.max_observed_cost {
            self.max_observed_cost = cost;
            self.adjust_tail_len();
            self.adjust_reward_scale();
            self.execs_since_new_max = 0;
            self.observed_new_cost = true;
            true
        } else {
            self.execs_since_new_max += 1;
            false
        }
    }

    pub fn has_new_hotspot(&mut self, hotspot: u32) -> bool {
        if hotspot > self.max_observed_hotspot {
            self.max_observed_hotspot = hotspot;
            true
        } else {
            false
        }
    }

    fn adjust_tail_len(&mut self) {
        let range = self.max_observed_cost.saturating_sub(self.min_observed_cost);
        self.tail_len = tail_for_range(range);
    }

    fn adjust_reward_scale(&mut self) {
        if self.min_observed_cost == 0 {
            self.reward_scale = 1.0;
            return;
        }
        let diff = (self.max_observed_cost - self.min_observed_cost) as f64;
        self.reward_scale = if diff / self.min_observed_cost as f64 > 1.0 {
            1.0
        } else {
            100.0
        };
    }

    /// Reward for one run. `first_tree` keeps the length-weight adaptation
    /// confined to the first tree of the run.
    pub fn reward(&mut self, cost: u64, tokens_used: u32, first_tree: bool) -> f64 {
        if first_tree {
            self.adjust_len_weight(tokens_used);
        }
        // Quantile before the update: the run's standing among what was
        // known before it happened.
        let cost_reward = self.digest.cdf(cost as f64);
        self.digest.update(cost as f64);

        if self.raw_len_reward {
            return cost_reward + f64::from(tokens_used);
        }
        let len_reward = scale_to_range(f64::from(tokens_used), f64::from(self.budget), 0.0, 0.0, 1.0);
        cost_reward * (1.0 - self.len_weight) * self.reward_scale + len_reward * self.len_weight
    }

    /// Nudge the length weight: if under half of the recent inputs land in
    /// the top fifth of the budget, lean harder on length, else ease off.
    /// Hitting the 0.9 ceiling too long abandons blending for raw length.
    fn adjust_len_weight(&mut self, tokens_used: u32) {
        if self.len_buffer.len() == LEN_WINDOW {
            self.len_buffer.remove(0);
        }
        self.len_buffer.push(tokens_used);
        if self.raw_len_reward || self.len_buffer.len() < LEN_WINDOW {
            return;
        }
        let top_fifth = (0.8 * f64::from(self.budget)) as u32;
        if fraction_at_or_above(&self.len_buffer, top_fifth) < 0.5 {
            if self.len_weight < 0.9 {
                self.len_weight += LEN_NUDGE;
            } else {
                self.skipped += 1;
            }
            if self.skipped > (LEN_WINDOW as u64) * 5 {
                self.raw_len_reward = true;
                self.force_reset = true;
                self.len_weight = f64::INFINITY;
            }
        } else if self.len_weight > 0.1 {
            self.len_weight -= LEN_NUDGE;
        }
        self.weight_total += self.len_weight;
    }

    /// At the first tree drop, freeze the length weight at its running
    /// average over that tree.
    pub fn settle_len_weight(&mut self, execs: u64) {
        if !self.raw_len_reward && execs > 0 {
            self.len_weight = (self.weight_total / execs as f64 * 10_000.0).round() / 10_000.0;
        }
    }
}
