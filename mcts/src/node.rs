//! Tree node storage.

use grammar::{Bias, Derivation};

/// Index into the tree's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const NONE: NodeId = NodeId(u32::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// One node of the search tree: a partial derivation plus the visit
/// statistics UCB1 needs. Children are populated lazily once the node has
/// earned enough visits.
#[derive(Debug)]
pub struct SearchNode {
    pub parent: NodeId,
    pub children: Vec<NodeId>,
    /// Number of times a run has been credited to this node.
    pub visits: u32,
    /// Sum of credited rewards.
    pub value: f64,
    /// Exhausted; selection treats it as nonexistent.
    pub locked: bool,
    /// Best coverage news seen through this node (0/1/2).
    pub hnb: u8,
    /// A run through this node raised some edge's max hit count.
    pub hnm: bool,
    /// Largest hotspot hit count seen through this node.
    pub hotspot: u32,
    pub derivation: Derivation,
    /// Chooser whose history is the choice path from the root to here.
    pub bias: Bias,
}

impl SearchNode {
    pub fn new(parent: NodeId, derivation: Derivation, bias: Bias) -> Self {
        Self {
            parent,
            children: Vec::new(),
            visits: 0,
            value: 0.0,
            locked: false,
            hnb: 0,
            hnm: false,
            hotspot: 0,
            derivation,
            bias,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.derivation.is_terminal()
    }

    /// A leaf has no populated children. Terminals are always leaves.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}
