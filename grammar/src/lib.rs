//! Budget-aware context-free grammars for worst-case input search.
//!
//! A [`Grammar`] stores right-hand-side items in a flat arena; a
//! [`Derivation`] walks it left-to-right under a hard token budget; a
//! [`Bias`] learns which expansion choices lead to expensive inputs. The
//! `parse` module loads grammars from BNF text.

pub mod bias;
pub mod derive;
pub mod item;
pub mod parse;

// Re-export main types
pub use bias::{Bias, BiasConfig, BiasCoreHandle};
pub use derive::Derivation;
pub use item::{Grammar, ItemId, RhsItem, HUGE};
pub use parse::parse_bnf;

use thiserror::Error;

/// Errors raised while building or deriving from a grammar.
#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("grammar has no productions")]
    EmptyGrammar,

    #[error("symbol '{0}' is referenced but never defined")]
    UndefinedSymbol(String),

    #[error("start symbol {0} has no finite derivation")]
    NoFiniteDerivation(String),

    #[error("no alternative of {item} fits within budget {budget}")]
    NoChoiceWithinBudget { item: String, budget: u32 },

    #[error("budget accounting violated at terminal: allowed {allowed}, used {used}, margin {margin}")]
    BudgetMismatch { allowed: u32, used: u32, margin: u32 },

    #[error("bias constant {name} = {value} outside the open interval (0, 1)")]
    BiasConstant { name: &'static str, value: f64 },

    #[error("BNF parse error at line {line}: {msg}")]
    Parse { line: usize, msg: String },
}
