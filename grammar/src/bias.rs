//! Learnable choice bias, a weighted substitute for uniform choice.
//!
//! A side table of weights is shared by every chooser forked from a common
//! root; rewarding or penalizing a chooser nudges the weights of the choices
//! it made, and future choices lean toward high-weight options. Weights for
//! bigrams (previous choice, this choice) dominate unconditional weights
//! because context matters more than popularity.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use rand::Rng;

use crate::item::{Grammar, ItemId};
use crate::GrammarError;

/// Tuning constants for the bias tables. All four must lie in the open
/// interval (0, 1); the deltas move a weight that fraction of the way toward
/// 1.0 (reward) or 0.0 (penalty), so weights can never leave the interval.
#[derive(Debug, Clone, Copy)]
pub struct BiasConfig {
    /// Starting weight for an option never seen before.
    pub default_weight: f64,
    /// Learning rate for rewards. Large values oscillate.
    pub reward_delta: f64,
    /// Learning rate for penalties. Rewards are rarer than penalties, so
    /// this is much smaller than `reward_delta`.
    pub penalty_delta: f64,
    /// Fraction of a blended weight taken from the bigram table when the
    /// bigram has been seen. Individual options are seen more often than
    /// bigrams, so this is high but not 1.0.
    pub bigram_priority: f64,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            default_weight: 0.5,
            reward_delta: 0.5,
            penalty_delta: 0.05,
            bigram_priority: 0.99,
        }
    }
}

impl BiasConfig {
    pub fn validate(&self) -> Result<(), GrammarError> {
        let fields = [
            ("default_weight", self.default_weight),
            ("reward_delta", self.reward_delta),
            ("penalty_delta", self.penalty_delta),
            ("bigram_priority", self.bigram_priority),
        ];
        for (name, value) in fields {
            if !(value > 0.0 && value < 1.0) {
                return Err(GrammarError::BiasConstant { name, value });
            }
        }
        Ok(())
    }
}

/// Shared core of the biased chooser. Forked [`Bias`] values all point at
/// the same core, so learning in one rollout is visible to every later one.
#[derive(Debug)]
pub struct BiasCore {
    cfg: BiasConfig,
    weights: HashMap<ItemId, f64>,
    bigram_weights: HashMap<(ItemId, ItemId), f64>,
}

pub type BiasCoreHandle = Rc<RefCell<BiasCore>>;

impl BiasCore {
    fn new(cfg: BiasConfig) -> Self {
        Self {
            cfg,
            weights: HashMap::new(),
            bigram_weights: HashMap::new(),
        }
    }

    /// Current blended weight of `item` after `prior`, initializing the
    /// unconditional entry on first sight.
    fn weight(&mut self, item: ItemId, prior: Option<ItemId>) -> f64 {
        let item_weight = *self.weights.entry(item).or_insert(self.cfg.default_weight);
        let bi_weight = match prior.and_then(|p| self.bigram_weights.get(&(p, item))) {
            Some(&w) => w,
            // Never seen in this context; fall back to the weight from all
            // contexts in which the item has been seen.
            None => return item_weight,
        };
        self.cfg.bigram_priority * bi_weight + (1.0 - self.cfg.bigram_priority) * item_weight
    }

    fn choose<R: Rng>(
        &mut self,
        rng: &mut R,
        choices: &[ItemId],
        prior: Option<ItemId>,
    ) -> Option<ItemId> {
        if choices.is_empty() {
            return None;
        }
        let sum_weight: f64 = choices.iter().map(|&c| self.weight(c, prior)).sum();
        let r: f64 = rng.gen();
        let mut bound = 0.0;
        for &item in choices {
            bound += self.weight(item, prior) / sum_weight;
            if r <= bound {
                return Some(item);
            }
        }
        // Roundoff can leave bound fractionally short of 1.0.
        choices.last().copied()
    }

    fn reward(&mut self, item: ItemId, prior: Option<ItemId>) {
        let delta = self.cfg.reward_delta;
        let old = self.weight(item, None);
        self.weights.insert(item, old + delta * (1.0 - old));
        if let Some(prior) = prior {
            let old = *self
                .bigram_weights
                .entry((prior, item))
                .or_insert(self.cfg.default_weight);
            self.bigram_weights
                .insert((prior, item), old + delta * (1.0 - old));
        }
    }

    fn penalize(&mut self, item: ItemId, prior: Option<ItemId>) {
        let delta = self.cfg.penalty_delta;
        let old = self.weight(item, None);
        self.weights.insert(item, old - delta * old);
        if let Some(prior) = prior {
            let old = *self
                .bigram_weights
                .entry((prior, item))
                .or_insert(self.cfg.default_weight);
            self.bigram_weights.insert((prior, item), old - delta * old);
        }
    }

    /// Multi-line rendering of both weight tables for end-of-run dumps.
    pub fn dump(&self, gram: &Grammar) -> String {
        let mut lines = vec!["Individual choice weights:".to_string()];
        let mut singles: Vec<_> = self.weights.iter().collect();
        singles.sort_by_key(|(id, _)| **id);
        for (&id, w) in singles {
            lines.push(format!("   {}:\t{w}", gram.describe(id)));
        }
        lines.push(String::new());
        lines.push("Bigram weights:".to_string());
        let mut pairs: Vec<_> = self.bigram_weights.iter().collect();
        pairs.sort_by_key(|(k, _)| **k);
        for (&(prior, item), w) in pairs {
            lines.push(format!(
                "   {} => {}:\t{w}",
                gram.describe(prior),
                gram.describe(item)
            ));
        }
        lines.join("\n")
    }
}

/// A weighted chooser with its own choice history.
///
/// `fork()` copies the history but shares the core tables, so a rollout can
/// extend a node's history privately and still feed its reward back into the
/// shared state.
#[derive(Debug)]
pub struct Bias {
    core: BiasCoreHandle,
    history: Vec<ItemId>,
}

impl Bias {
    pub fn new(cfg: BiasConfig) -> Result<Self, GrammarError> {
        cfg.validate()?;
        Ok(Self {
            core: Rc::new(RefCell::new(BiasCore::new(cfg))),
            history: Vec::new(),
        })
    }

    /// Fresh chooser sharing an existing core, with empty history. Used when
    /// the search tree is rebuilt but learned weights should survive.
    pub fn with_core(core: BiasCoreHandle) -> Self {
        Self {
            core,
            history: Vec::new(),
        }
    }

    pub fn core(&self) -> BiasCoreHandle {
        Rc::clone(&self.core)
    }

    pub fn fork(&self) -> Bias {
        Bias {
            core: Rc::clone(&self.core),
            history: self.history.clone(),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Record a choice made by some other policy so rewards credit it too.
    pub fn record(&mut self, choice: ItemId) {
        self.history.push(choice);
    }

    /// Weighted choice among `choices`, recorded in the history.
    pub fn choose<R: Rng>(&mut self, rng: &mut R, choices: &[ItemId]) -> Option<ItemId> {
        let prior = self.history.last().copied();
        let choice = self.core.borrow_mut().choose(rng, choices, prior)?;
        self.history.push(choice);
        Some(choice)
    }

    /// These were good choices; make them more often.
    pub fn reward(&mut self) {
        let mut core = self.core.borrow_mut();
        let mut prior = None;
        for &item in &self.history {
            core.reward(item, prior);
            prior = Some(item);
        }
    }

    /// These were not good choices; avoid them.
    pub fn penalize(&mut self) {
        let mut core = self.core.borrow_mut();
        let mut prior = None;
        for &item in &self.history {
            core.penalize(item, prior);
            prior = Some(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn two_options() -> (Grammar, ItemId, ItemId) {
        let mut g = Grammar::new("bias", false);
        let s = g.symbol("S");
        let a = g.literal("a");
        let b = g.literal("b");
        let alt = g.alt(vec![a, b]);
        g.add_production(s, alt);
        g.finalize().unwrap();
        (g, a, b)
    }

    #[test]
    fn config_rejects_out_of_range_constants() {
        let cfg = BiasConfig {
            reward_delta: 1.0,
            ..BiasConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(GrammarError::BiasConstant {
                name: "reward_delta",
                ..
            })
        ));
        assert!(BiasConfig::default().validate().is_ok());
    }

    #[test]
    fn fresh_options_are_chosen_near_uniformly() {
        let (_g, a, b) = two_options();
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let bias = Bias::new(BiasConfig::default()).unwrap();
        let mut picked_a = 0u32;
        let trials = 10_000;
        for _ in 0..trials {
            // Fork per trial so bigram context does not accumulate.
            let mut fork = bias.fork();
            if fork.choose(&mut rng, &[a, b]) == Some(a) {
                picked_a += 1;
            }
        }
        let frac = f64::from(picked_a) / f64::from(trials);
        assert!((0.45..=0.55).contains(&frac), "fraction was {frac}");
        // Root history untouched by forks.
        assert_eq!(bias.history_len(), 0);
    }

    #[test]
    fn weights_stay_strictly_inside_the_unit_interval() {
        let (_g, a, b) = two_options();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let bias = Bias::new(BiasConfig::default()).unwrap();
        for round in 0..1_000 {
            let mut fork = bias.fork();
            fork.choose(&mut rng, &[a, b]);
            fork.choose(&mut rng, &[a, b]);
            if round % 2 == 0 {
                fork.reward();
            } else {
                fork.penalize();
            }
        }
        let core = bias.core();
        let core = core.borrow();
        for &w in core.weights.values() {
            assert!(w > 0.0 && w < 1.0, "unconditional weight {w} escaped");
        }
        for &w in core.bigram_weights.values() {
            assert!(w > 0.0 && w < 1.0, "bigram weight {w} escaped");
        }
    }

    #[test]
    fn reward_shifts_future_choices_toward_the_rewarded_option() {
        let (_g, a, b) = two_options();
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let bias = Bias::new(BiasConfig::default()).unwrap();
        for _ in 0..20 {
            let mut fork = bias.fork();
            // Pretend 'a' was chosen and paid off.
            fork.record(a);
            fork.reward();
        }
        let mut picked_a = 0u32;
        let trials = 2_000;
        for _ in 0..trials {
            let mut fork = bias.fork();
            if fork.choose(&mut rng, &[a, b]) == Some(a) {
                picked_a += 1;
            }
        }
        let frac = f64::from(picked_a) / f64::from(trials);
        assert!(frac > 0.8, "rewarded fraction was only {frac}");
    }

    #[test]
    fn fork_shares_the_core_but_not_the_history() {
        let (_g, a, b) = two_options();
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let mut root = Bias::new(BiasConfig::default()).unwrap();
        root.choose(&mut rng, &[a, b]);
        let mut fork = root.fork();
        assert_eq!(fork.history_len(), 1);
        fork.choose(&mut rng, &[a, b]);
        assert_eq!(fork.history_len(), 2);
        assert_eq!(root.history_len(), 1);
        assert!(Rc::ptr_eq(&root.core, &fork.core));
    }

    #[test]
    fn dump_lists_both_weight_tables() {
        let (g, a, b) = two_options();
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let mut bias = Bias::new(BiasConfig::default()).unwrap();
        bias.choose(&mut rng, &[a, b]);
        bias.choose(&mut rng, &[a, b]);
        bias.reward();
        let text = bias.core().borrow().dump(&g);
        assert!(text.contains("Individual choice weights:"));
        assert!(text.contains("Bigram weights:"));
        assert!(text.contains("=>"));
    }
}
