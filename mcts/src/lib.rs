//! Monte Carlo tree search over grammar derivations.
//!
//! The tree's states are partial derivations; its actions are grammar
//! expansion choices. Each iteration selects a leaf by UCB1, completes the
//! derivation (by rollout if the leaf is not terminal), runs the resulting
//! input through an [`Executor`], and backpropagates a reward built from the
//! cost's quantile and the input's length. Trees are disposable: when the
//! cost stream stabilizes the tree is dropped and rebuilt, keeping only the
//! learned choice bias.

pub mod config;
pub mod digest;
pub mod exec;
pub mod node;
pub mod reward;
pub mod search;
pub mod tree;

// Re-export main types
pub use config::{ConfigError, SearchConfig};
pub use digest::Digest;
pub use exec::{CorpusSink, Executor, ExecutorError, Interesting, NullSink, RunFeedback, RunKind};
pub use node::{NodeId, SearchNode};
pub use reward::{EpsilonGreedy, RewardState};
pub use search::{Progress, RunLimit, RunReport, Search, SearchError, TreeStats, WarmupSummary};
pub use tree::SearchTree;
