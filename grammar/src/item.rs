//! Budget-aware grammar representation.
//!
//! All right-hand-side items live in a flat arena owned by [`Grammar`] and are
//! referenced by [`ItemId`]. Named symbols resolve through the symbol table by
//! lookup, never by structural embedding, so recursive productions cannot
//! create ownership cycles.

use std::collections::HashMap;

use tracing::debug;

use crate::GrammarError;

/// Sentinel larger than any sentence we will ever generate. Used both as the
/// "no finite minimum yet" marker during the fixed point and as the cap for
/// potential-token sums.
pub const HUGE: u32 = 999_999;

/// Index into the item arena. Using a newtype for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub u32);

impl ItemId {
    pub const NONE: ItemId = ItemId(u32::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// A right-hand-side item. The variant set is closed; `choices` and the
/// derivation engine match exhaustively over it.
#[derive(Debug, Clone)]
pub enum RhsItem {
    /// Fixed terminal text. Empty text is a valid zero-cost terminal and is
    /// distinct from "no production".
    Lit { text: String, cost: u32 },

    /// Named non-terminal. `expansion` is NONE until its production is added.
    Sym { name: String, expansion: ItemId },

    /// Ordered items consumed together. The empty sequence is the canonical
    /// empty production.
    Seq { items: Vec<ItemId> },

    /// Alternatives; exactly one is selected per derivation step.
    Alt { alts: Vec<ItemId> },

    /// Zero-or-more repetition. `more` is the synthesized "one more
    /// repetition, then repeat" sequence, filled in by `finalize`.
    Star { item: ItemId, more: ItemId },
}

/// A context-free grammar with memoized minimum/potential token counts.
///
/// Build it through the constructor methods (`literal`, `symbol`, `seq`,
/// `alt`, `star`, `add_production`), then call [`Grammar::finalize`] exactly
/// once before handing it to the derivation engine.
#[derive(Debug, Clone)]
pub struct Grammar {
    name: String,
    items: Vec<RhsItem>,
    min_tokens: Vec<u32>,
    pot_tokens: Vec<u32>,
    symbols: HashMap<String, ItemId>,
    start: ItemId,
    empty: ItemId,
    len_based_cost: bool,
    finalized: bool,
}

impl Grammar {
    /// Create an empty grammar. With `len_based_cost` a literal costs its
    /// byte length; otherwise every non-empty literal costs one token.
    pub fn new(name: impl Into<String>, len_based_cost: bool) -> Self {
        let mut gram = Self {
            name: name.into(),
            items: Vec::new(),
            min_tokens: Vec::new(),
            pot_tokens: Vec::new(),
            symbols: HashMap::new(),
            start: ItemId::NONE,
            empty: ItemId::NONE,
            len_based_cost,
            finalized: false,
        };
        gram.empty = gram.push(RhsItem::Seq { items: Vec::new() });
        gram
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared empty production.
    pub fn empty(&self) -> ItemId {
        self.empty
    }

    /// The start symbol. Set explicitly or defaulted to the first production.
    pub fn start(&self) -> ItemId {
        self.start
    }

    pub fn set_start(&mut self, id: ItemId) {
        self.start = id;
    }

    pub fn item(&self, id: ItemId) -> &RhsItem {
        &self.items[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn push(&mut self, item: RhsItem) -> ItemId {
        let id = ItemId(self.items.len() as u32);
        self.items.push(item);
        id
    }

    /// Intern a literal.
    pub fn literal(&mut self, text: impl Into<String>) -> ItemId {
        let text = text.into();
        let cost = if text.is_empty() {
            0
        } else if self.len_based_cost {
            text.len() as u32
        } else {
            1
        };
        self.push(RhsItem::Lit { text, cost })
    }

    /// Get or create the named non-terminal.
    pub fn symbol(&mut self, name: impl Into<String>) -> ItemId {
        let name = name.into();
        if let Some(&id) = self.symbols.get(&name) {
            return id;
        }
        let id = self.push(RhsItem::Sym {
            name: name.clone(),
            expansion: ItemId::NONE,
        });
        self.symbols.insert(name, id);
        id
    }

    pub fn seq(&mut self, items: Vec<ItemId>) -> ItemId {
        self.push(RhsItem::Seq { items })
    }

    pub fn alt(&mut self, alts: Vec<ItemId>) -> ItemId {
        self.push(RhsItem::Alt { alts })
    }

    pub fn star(&mut self, item: ItemId) -> ItemId {
        self.push(RhsItem::Star {
            item,
            more: ItemId::NONE,
        })
    }

    /// Attach a production to a symbol. Repeated productions for the same
    /// symbol are merged into a single alternative list.
    pub fn add_production(&mut self, sym: ItemId, rhs: ItemId) {
        if self.start.is_none() {
            self.start = sym;
        }
        let existing = match &self.items[sym.0 as usize] {
            RhsItem::Sym { expansion, .. } => *expansion,
            other => panic!("add_production on non-symbol item {other:?}"),
        };
        let expansion = if existing.is_none() {
            rhs
        } else if let RhsItem::Alt { alts } = &mut self.items[existing.0 as usize] {
            alts.push(rhs);
            existing
        } else {
            self.alt(vec![existing, rhs])
        };
        if let RhsItem::Sym { expansion: e, .. } = &mut self.items[sym.0 as usize] {
            *e = expansion;
        }
    }

    /// Human-readable description of an item, used in error messages.
    pub fn describe(&self, id: ItemId) -> String {
        match self.item(id) {
            RhsItem::Lit { text, .. } => format!("'{}'", text.escape_default()),
            RhsItem::Sym { name, .. } => name.clone(),
            RhsItem::Seq { items } if items.is_empty() => "/* empty */".into(),
            RhsItem::Seq { items } => {
                let parts: Vec<String> = items.iter().map(|&i| self.describe(i)).collect();
                parts.join(" ")
            }
            RhsItem::Alt { alts } => {
                let parts: Vec<String> = alts.iter().map(|&i| self.describe(i)).collect();
                format!("({})", parts.join(" | "))
            }
            RhsItem::Star { item, .. } => format!("{}*", self.describe(*item)),
        }
    }

    /// Minimum terminal tokens any derivation through `id` must consume.
    /// Only meaningful after `finalize`.
    pub fn min_tokens(&self, id: ItemId) -> u32 {
        debug_assert!(self.finalized, "min_tokens before finalize");
        self.min_tokens[id.0 as usize]
    }

    /// Upper bound on the tokens obtainable through `id`, capped at [`HUGE`]
    /// (Kleene repetition is unbounded). Used by minimum-length filtering.
    pub fn pot_tokens(&self, id: ItemId) -> u32 {
        debug_assert!(self.finalized, "pot_tokens before finalize");
        self.pot_tokens[id.0 as usize]
    }

    /// Resolve memoized token counts and synthesize Kleene continuation
    /// items. Fails if a symbol was referenced but never defined, or if the
    /// start symbol has no terminating derivation.
    pub fn finalize(&mut self) -> Result<(), GrammarError> {
        if self.finalized {
            return Ok(());
        }
        if self.start.is_none() {
            return Err(GrammarError::EmptyGrammar);
        }
        for (name, &id) in &self.symbols {
            if let RhsItem::Sym { expansion, .. } = self.item(id) {
                if expansion.is_none() {
                    return Err(GrammarError::UndefinedSymbol(name.clone()));
                }
            }
        }

        // Give every Star its "one more repetition" sequence before the
        // fixed point so the new items get token counts too.
        let star_ids: Vec<ItemId> = (0..self.items.len() as u32)
            .map(ItemId)
            .filter(|&id| matches!(self.item(id), RhsItem::Star { .. }))
            .collect();
        for star in star_ids {
            let inner = match self.item(star) {
                RhsItem::Star { item, .. } => *item,
                _ => unreachable!(),
            };
            let more = self.seq(vec![inner, star]);
            if let RhsItem::Star { more: m, .. } = &mut self.items[star.0 as usize] {
                *m = more;
            }
        }

        self.calc_min_tokens();
        self.calc_pot_tokens();
        self.finalized = true;

        if self.min_tokens(self.start) >= HUGE {
            return Err(GrammarError::NoFiniteDerivation(self.describe(self.start)));
        }
        debug!(
            name = %self.name,
            items = self.items.len(),
            symbols = self.symbols.len(),
            min_tokens = self.min_tokens(self.start),
            "grammar finalized"
        );
        Ok(())
    }

    /// Fixed point over possibly-recursive symbol definitions. Items that
    /// never reach a finite minimum keep the HUGE sentinel; the budget filter
    /// then excludes them everywhere.
    fn calc_min_tokens(&mut self) {
        self.min_tokens = vec![HUGE; self.items.len()];
        loop {
            let mut changed = false;
            for idx in 0..self.items.len() {
                let new = match &self.items[idx] {
                    RhsItem::Lit { cost, .. } => *cost,
                    RhsItem::Sym { expansion, .. } => self.min_tokens[expansion.0 as usize],
                    RhsItem::Seq { items } => items
                        .iter()
                        .map(|i| self.min_tokens[i.0 as usize])
                        .fold(0u32, |a, b| a.saturating_add(b).min(HUGE)),
                    RhsItem::Alt { alts } => alts
                        .iter()
                        .map(|i| self.min_tokens[i.0 as usize])
                        .min()
                        .unwrap_or(HUGE),
                    RhsItem::Star { .. } => 0,
                };
                if new < self.min_tokens[idx] {
                    self.min_tokens[idx] = new;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn calc_pot_tokens(&mut self) {
        self.pot_tokens = vec![0; self.items.len()];
        for (idx, item) in self.items.iter().enumerate() {
            if let RhsItem::Lit { cost, .. } = item {
                self.pot_tokens[idx] = *cost;
            }
        }
        loop {
            let mut changed = false;
            for idx in 0..self.items.len() {
                let new = match &self.items[idx] {
                    RhsItem::Lit { cost, .. } => *cost,
                    RhsItem::Sym { expansion, .. } => self.pot_tokens[expansion.0 as usize],
                    RhsItem::Seq { items } => items
                        .iter()
                        .map(|i| self.pot_tokens[i.0 as usize])
                        .fold(0u32, |a, b| a.saturating_add(b).min(HUGE)),
                    RhsItem::Alt { alts } => alts
                        .iter()
                        .map(|i| self.pot_tokens[i.0 as usize])
                        .max()
                        .unwrap_or(0),
                    RhsItem::Star { .. } => HUGE,
                };
                if new > self.pot_tokens[idx] {
                    self.pot_tokens[idx] = new;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Alternatives reachable from `id` that fit within `budget`, in
    /// production order.
    ///
    /// A symbol hands back the choices of its expansion (one level of
    /// indirection is flattened away; no tree node is ever created for a
    /// choice-through-symbol). A Kleene offers "stop" and, budget allowing,
    /// "one more repetition". A literal or sequence is its own sole choice.
    ///
    /// An empty result is a configuration error: the grammar cannot produce
    /// any string from this point within the budget.
    pub fn choices(&self, id: ItemId, budget: u32) -> Result<Vec<ItemId>, GrammarError> {
        debug_assert!(self.finalized, "choices before finalize");
        let list = match self.item(id) {
            RhsItem::Lit { .. } | RhsItem::Seq { .. } => {
                if self.min_tokens(id) <= budget {
                    vec![id]
                } else {
                    Vec::new()
                }
            }
            RhsItem::Sym { expansion, .. } => return self.choices(*expansion, budget),
            RhsItem::Alt { alts } => alts
                .iter()
                .copied()
                .filter(|&a| self.min_tokens(a) <= budget)
                .collect(),
            RhsItem::Star { item, more } => {
                let mut opts = vec![self.empty];
                if self.min_tokens(*item) <= budget {
                    opts.push(*more);
                }
                opts
            }
        };
        if list.is_empty() {
            return Err(GrammarError::NoChoiceWithinBudget {
                item: self.describe(id),
                budget,
            });
        }
        Ok(list)
    }
}
