//! Left-to-right derivation under a hard token budget.
//!
//! A [`Derivation`] is a partial sentence: generated text on the left, a
//! LIFO stack of items still to expand on the right. One level of external
//! control is exposed at each choice point so a search policy can pick the
//! expansion; everything choice-free (literals, sequences) is consumed
//! eagerly so no state is ever parked on a choiceless item.

use rand::Rng;

use crate::bias::Bias;
use crate::item::{Grammar, ItemId, RhsItem};
use crate::GrammarError;

/// A derivation in progress. Cheap to clone; `expand` clones and applies one
/// choice, leaving the original untouched.
#[derive(Debug, Clone)]
pub struct Derivation {
    text: String,
    /// Items still to expand, top of stack at the end. The current choice
    /// point is held in `head`, not on the stack.
    pending: Vec<ItemId>,
    head: Option<ItemId>,
    /// Full sentence budget. Fixed for the life of the derivation.
    budget: u32,
    /// Budget not yet committed to minimum expansions. At a terminal,
    /// `tokens_used + margin == budget` must hold.
    margin: u32,
    tokens_used: u32,
    min_length: u32,
}

impl Derivation {
    /// Start a derivation from the grammar's start symbol. The budget must
    /// cover the start symbol's minimum; callers bump it if not.
    pub fn new(gram: &Grammar, budget: u32, min_length: u32) -> Result<Self, GrammarError> {
        let start = gram.start();
        let start_min = gram.min_tokens(start);
        if start_min > budget {
            return Err(GrammarError::NoChoiceWithinBudget {
                item: gram.describe(start),
                budget,
            });
        }
        let mut d = Self {
            text: String::new(),
            pending: vec![start],
            head: None,
            budget,
            margin: budget - start_min,
            tokens_used: 0,
            min_length,
        };
        d.normalize(gram);
        Ok(d)
    }

    /// Shift literals and flatten sequences until the top of the stack is a
    /// choice point or the stack is empty.
    fn normalize(&mut self, gram: &Grammar) {
        self.head = None;
        while let Some(top) = self.pending.pop() {
            match gram.item(top) {
                RhsItem::Lit { text, cost } => {
                    self.text.push_str(text);
                    self.tokens_used += cost;
                }
                RhsItem::Seq { items } => {
                    self.pending.extend(items.iter().rev().copied());
                }
                RhsItem::Sym { .. } | RhsItem::Alt { .. } | RhsItem::Star { .. } => {
                    self.head = Some(top);
                    break;
                }
            }
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tokens_used(&self) -> u32 {
        self.tokens_used
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn margin(&self) -> u32 {
        self.margin
    }

    /// The choice point awaiting expansion, if any.
    pub fn head(&self) -> Option<ItemId> {
        self.head
    }

    /// A derivation is terminal when nothing remains to expand.
    pub fn is_terminal(&self) -> bool {
        self.head.is_none() && self.pending.is_empty()
    }

    /// Budget available to the head's expansion: the uncommitted margin plus
    /// the head's own minimum, which the margin already accounts for.
    pub fn allowed_budget(&self, gram: &Grammar) -> u32 {
        match self.head {
            Some(head) => self.margin + gram.min_tokens(head),
            None => self.margin,
        }
    }

    /// Expansions available at the head, budget-filtered, then narrowed by
    /// the minimum-length preference.
    ///
    /// The length filter is best-effort: if the sentence still needs more
    /// tokens than the rest of the stack can possibly provide, options whose
    /// potential covers the shortfall are preferred, but when no option
    /// does, the full budget-valid list is returned rather than failing.
    pub fn choices(&self, gram: &Grammar) -> Result<Vec<ItemId>, GrammarError> {
        let head = self.head.ok_or(GrammarError::NoChoiceWithinBudget {
            item: "<terminal>".to_string(),
            budget: self.margin,
        })?;
        let all = gram.choices(head, self.allowed_budget(gram))?;

        let still_needed = i64::from(self.min_length) - i64::from(self.tokens_used);
        let can_provide_later: i64 = self
            .pending
            .iter()
            .map(|&i| i64::from(gram.pot_tokens(i)))
            .sum();
        let need_immediately = still_needed - can_provide_later;
        if need_immediately > 0 {
            let long_enough: Vec<ItemId> = all
                .iter()
                .copied()
                .filter(|&c| i64::from(gram.pot_tokens(c)) >= need_immediately)
                .collect();
            if !long_enough.is_empty() {
                return Ok(long_enough);
            }
        }
        Ok(all)
    }

    /// Apply one choice from [`Derivation::choices`], producing the
    /// successor derivation. The margin drops by however much of it the
    /// choice commits beyond the head's minimum.
    pub fn expand(&self, gram: &Grammar, choice: ItemId) -> Derivation {
        let mut next = self.clone();
        if let Some(head) = next.head {
            let spent = gram.min_tokens(choice) - gram.min_tokens(head);
            next.margin -= spent;
        }
        next.pending.push(choice);
        next.normalize(gram);
        next
    }

    /// Verify the budget accounting at a terminal. A violation is an
    /// internal error; the caller should abort the run.
    pub fn check_budget(&self) -> Result<(), GrammarError> {
        debug_assert!(self.is_terminal());
        if self.tokens_used + self.margin != self.budget {
            return Err(GrammarError::BudgetMismatch {
                allowed: self.budget,
                used: self.tokens_used,
                margin: self.margin,
            });
        }
        Ok(())
    }

    /// Complete the derivation with uniform random choices, or with the
    /// given chooser's learned weights.
    pub fn rollout<R: Rng>(
        mut self,
        gram: &Grammar,
        rng: &mut R,
        mut bias: Option<&mut Bias>,
    ) -> Result<Derivation, GrammarError> {
        while !self.is_terminal() {
            let options = self.choices(gram)?;
            let pick = match bias.as_deref_mut() {
                Some(b) => b
                    .choose(rng, &options)
                    .ok_or(GrammarError::NoChoiceWithinBudget {
                        item: "<rollout>".to_string(),
                        budget: self.margin,
                    })?,
                None => options[rng.gen_range(0..options.len())],
            };
            self = self.expand(gram, pick);
        }
        self.check_budget()?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

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

    #[test]
    fn choiceless_grammar_is_terminal_at_construction() {
        let mut g = Grammar::new("flat", false);
        let s = g.symbol("S");
        let a = g.literal("a");
        let b = g.literal("b");
        let seq = g.seq(vec![a, b]);
        g.add_production(s, seq);
        g.finalize().unwrap();

        // One choice point: S has a single alternative.
        let d = Derivation::new(&g, 5, 0).unwrap();
        assert!(!d.is_terminal());
        let opts = d.choices(&g).unwrap();
        assert_eq!(opts.len(), 1);
        let done = d.expand(&g, opts[0]);
        assert!(done.is_terminal());
        assert_eq!(done.text(), "ab");
        assert_eq!(done.tokens_used(), 2);
        assert!(done.check_budget().is_ok());
    }

    #[test]
    fn budget_is_never_exceeded_and_sentences_end_properly() {
        let g = tail_recursive();
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        for _ in 0..200 {
            let d = Derivation::new(&g, 5, 0).unwrap();
            let done = d.rollout(&g, &mut rng, None).unwrap();
            let text = done.text();
            assert!(text.ends_with('b'), "derivation '{text}' did not finish");
            assert!(text.len() <= 5, "'{text}' exceeds the budget");
            assert_eq!(
                done.tokens_used() + done.margin(),
                done.budget(),
                "budget accounting broken for '{text}'"
            );
        }
    }

    #[test]
    fn recursion_is_cut_off_when_the_margin_runs_out() {
        let g = tail_recursive();
        // Budget 1 can only afford the base case.
        let d = Derivation::new(&g, 1, 0).unwrap();
        let opts = d.choices(&g).unwrap();
        assert_eq!(opts.len(), 1);
        let done = d.expand(&g, opts[0]);
        assert!(done.is_terminal());
        assert_eq!(done.text(), "b");
    }

    #[test]
    fn insufficient_budget_for_the_start_symbol_is_an_error() {
        let mut g = Grammar::new("big", false);
        let s = g.symbol("S");
        let long = {
            let a = g.literal("a");
            let b = g.literal("b");
            g.seq(vec![a, b])
        };
        g.add_production(s, long);
        g.finalize().unwrap();
        assert!(matches!(
            Derivation::new(&g, 1, 0),
            Err(GrammarError::NoChoiceWithinBudget { .. })
        ));
    }

    #[test]
    fn kleene_star_repeats_within_budget() {
        let mut g = Grammar::new("star", false);
        let s = g.symbol("S");
        let a = g.literal("a");
        let star = g.star(a);
        g.add_production(s, star);
        g.finalize().unwrap();

        let mut rng = ChaCha20Rng::seed_from_u64(17);
        for _ in 0..100 {
            let d = Derivation::new(&g, 4, 0).unwrap();
            let done = d.rollout(&g, &mut rng, None).unwrap();
            assert!(done.text().len() <= 4);
            assert!(done.text().chars().all(|c| c == 'a'));
        }
    }

    #[test]
    fn min_length_filter_prefers_options_that_can_reach_it() {
        let mut g = Grammar::new("len", true);
        let s = g.symbol("S");
        let short = g.literal("a");
        let long = g.literal("bbbb");
        let alt = g.alt(vec![short, long]);
        g.add_production(s, alt);
        g.finalize().unwrap();

        let d = Derivation::new(&g, 10, 3).unwrap();
        let opts = d.choices(&g).unwrap();
        assert_eq!(opts.len(), 1);
        assert_eq!(g.pot_tokens(opts[0]), 4);
    }

    #[test]
    fn min_length_filter_falls_back_when_nothing_is_long_enough() {
        let mut g = Grammar::new("len2", true);
        let s = g.symbol("S");
        let short = g.literal("a");
        let long = g.literal("bbbb");
        let alt = g.alt(vec![short, long]);
        g.add_production(s, alt);
        g.finalize().unwrap();

        // Nothing can provide 30 tokens; the filter must not empty the list.
        let d = Derivation::new(&g, 40, 30).unwrap();
        let opts = d.choices(&g).unwrap();
        assert_eq!(opts.len(), 2);
    }

    #[test]
    fn biased_rollout_uses_and_extends_the_chooser_history() {
        let g = tail_recursive();
        let mut rng = ChaCha20Rng::seed_from_u64(23);
        let mut bias = Bias::new(crate::bias::BiasConfig::default()).unwrap();
        let d = Derivation::new(&g, 5, 0).unwrap();
        let done = d.rollout(&g, &mut rng, Some(&mut bias)).unwrap();
        assert!(done.is_terminal());
        assert!(bias.history_len() > 0);
    }
}
