//! The search tree: an arena of [`SearchNode`]s plus selection, expansion,
//! and backpropagation.

use grammar::{Bias, Derivation, Grammar, GrammarError};

use crate::node::{NodeId, SearchNode};

/// Arena-backed search tree. Dropping a tree drops every node at once;
/// nothing in the arena owns anything outside it except the shared bias
/// core, which deliberately survives resets.
#[derive(Debug)]
pub struct SearchTree {
    nodes: Vec<SearchNode>,
    root: NodeId,
    exploration_c: f64,
    expansion_threshold: u32,
    use_locking: bool,
}

impl SearchTree {
    /// Build a fresh tree over the grammar's start symbol. `bias` becomes
    /// the root chooser; pass one sharing an old core to keep learned
    /// weights across a reset.
    pub fn new(
        gram: &Grammar,
        budget: u32,
        min_length: u32,
        bias: Bias,
        exploration_c: f64,
        expansion_threshold: u32,
        use_locking: bool,
    ) -> Result<Self, GrammarError> {
        let derivation = Derivation::new(gram, budget, min_length)?;
        let root = SearchNode::new(NodeId::NONE, derivation, bias);
        Ok(Self {
            nodes: vec![root],
            root: NodeId(0),
            exploration_c,
            expansion_threshold,
            use_locking,
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &SearchNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut SearchNode {
        &mut self.nodes[id.0 as usize]
    }

    /// A node is new until it has been visited `expansion_threshold` times;
    /// new nodes are rolled out from rather than expanded.
    pub fn is_new(&self, id: NodeId) -> bool {
        self.node(id).visits < self.expansion_threshold
    }

    /// UCB1. The root scores 0, an unvisited node +inf (visit it first),
    /// a locked node -inf (never again).
    pub fn ucb1(&self, id: NodeId) -> f64 {
        let node = self.node(id);
        if node.parent.is_none() {
            return 0.0;
        }
        if node.visits == 0 {
            return f64::INFINITY;
        }
        if node.locked {
            return f64::NEG_INFINITY;
        }
        let parent_visits = self.node(node.parent).visits;
        let n = f64::from(node.visits);
        node.value / n + self.exploration_c * (f64::from(parent_visits).ln() / n).sqrt()
    }

    /// Child of `id` with the highest UCB1.
    pub fn best_child(&self, id: NodeId) -> Option<NodeId> {
        self.node(id)
            .children
            .iter()
            .copied()
            .max_by(|&a, &b| self.ucb1(a).total_cmp(&self.ucb1(b)))
    }

    /// Descend by UCB1 until a leaf (unexpanded or terminal) is reached.
    pub fn select_leaf(&self, from: NodeId) -> NodeId {
        let mut current = from;
        while !self.node(current).is_leaf() {
            match self.best_child(current) {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    /// Materialize a child for `choice`, which must come from the node's
    /// derivation choices. The child's chooser extends the parent's path.
    fn make_child(&mut self, gram: &Grammar, parent: NodeId, choice: grammar::ItemId) -> NodeId {
        let parent_node = self.node(parent);
        let derivation = parent_node.derivation.expand(gram, choice);
        let mut bias = parent_node.bias.fork();
        bias.record(choice);
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(SearchNode::new(parent, derivation, bias));
        id
    }

    /// Populate all budget-valid children of `id`. Returns how many edges
    /// were added.
    pub fn populate_children(
        &mut self,
        gram: &Grammar,
        id: NodeId,
    ) -> Result<usize, GrammarError> {
        debug_assert!(!self.node(id).is_terminal());
        let choices = self.node(id).derivation.choices(gram)?;
        let mut children = Vec::with_capacity(choices.len());
        for choice in choices {
            children.push(self.make_child(gram, id, choice));
        }
        let count = children.len();
        self.node_mut(id).children = children;
        Ok(count)
    }

    /// Credit `reward` to `id` and every ancestor, bumping visit counts.
    /// With locking on, a node whose populated children are all locked
    /// locks itself, so exhaustion climbs the tree one update at a time.
    pub fn backpropagate(&mut self, id: NodeId, reward: f64) {
        let mut current = id;
        loop {
            self.update(current, reward);
            let parent = self.node(current).parent;
            if parent.is_none() {
                break;
            }
            current = parent;
        }
    }

    fn update(&mut self, id: NodeId, reward: f64) {
        let should_lock = self.use_locking
            && !self.node(id).children.is_empty()
            && self
                .node(id)
                .children
                .iter()
                .all(|&c| self.node(c).locked);
        let node = self.node_mut(id);
        node.value += reward;
        node.visits += 1;
        if should_lock {
            node.locked = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grammar::BiasConfig;

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

    fn tree(gram: &Grammar, use_locking: bool) -> SearchTree {
        SearchTree::new(
            gram,
            5,
            0,
            Bias::new(BiasConfig::default()).unwrap(),
            2.0,
            10,
            use_locking,
        )
        .unwrap()
    }

    #[test]
    fn the_root_always_scores_zero() {
        let g = tail_recursive();
        let mut t = tree(&g, false);
        assert_eq!(t.ucb1(t.root()), 0.0);
        let root = t.root();
        t.backpropagate(root, 5.0);
        assert_eq!(t.ucb1(t.root()), 0.0);
    }

    #[test]
    fn unvisited_children_score_infinity() {
        let g = tail_recursive();
        let mut t = tree(&g, false);
        let root = t.root();
        let added = t.populate_children(&g, root).unwrap();
        assert_eq!(added, 2);
        for &c in &t.node(root).children.clone() {
            assert_eq!(t.ucb1(c), f64::INFINITY);
        }
    }

    #[test]
    fn locked_nodes_score_negative_infinity() {
        let g = tail_recursive();
        let mut t = tree(&g, true);
        let root = t.root();
        t.populate_children(&g, root).unwrap();
        let child = t.node(root).children[0];
        t.backpropagate(child, 1.0);
        t.node_mut(child).locked = true;
        assert_eq!(t.ucb1(child), f64::NEG_INFINITY);
    }

    #[test]
    fn visited_nodes_balance_value_and_exploration() {
        let g = tail_recursive();
        let mut t = tree(&g, false);
        let root = t.root();
        t.populate_children(&g, root).unwrap();
        let (a, b) = {
            let cs = &t.node(root).children;
            (cs[0], cs[1])
        };
        t.backpropagate(a, 10.0);
        t.backpropagate(b, 1.0);
        let score_a = t.ucb1(a);
        let score_b = t.ucb1(b);
        assert!(score_a.is_finite() && score_b.is_finite());
        // Same visit counts, so the higher-value child must win.
        assert!(score_a > score_b);
        assert_eq!(t.best_child(root), Some(a));
    }

    #[test]
    fn backpropagation_credits_every_ancestor_once() {
        let g = tail_recursive();
        let mut t = tree(&g, false);
        let root = t.root();
        t.populate_children(&g, root).unwrap();
        let child = t.node(root).children[0];
        t.populate_children(&g, child).unwrap();
        let grandchild = t.node(child).children[0];

        t.backpropagate(grandchild, 2.5);
        for id in [grandchild, child, root] {
            assert_eq!(t.node(id).visits, 1);
            assert_eq!(t.node(id).value, 2.5);
        }
    }

    #[test]
    fn a_node_locks_only_when_every_child_is_locked() {
        let g = tail_recursive();
        let mut t = tree(&g, true);
        let root = t.root();
        t.populate_children(&g, root).unwrap();
        let children = t.node(root).children.clone();
        assert_eq!(children.len(), 2);

        t.node_mut(children[0]).locked = true;
        let root_id = t.root();
        t.backpropagate(root_id, 1.0);
        assert!(!t.node(root_id).locked, "locked with an open child");

        t.node_mut(children[1]).locked = true;
        t.backpropagate(root_id, 1.0);
        assert!(t.node(root_id).locked);
    }

    #[test]
    fn without_locking_enabled_nothing_locks() {
        let g = tail_recursive();
        let mut t = tree(&g, false);
        let root = t.root();
        t.populate_children(&g, root).unwrap();
        for c in t.node(root).children.clone() {
            t.node_mut(c).locked = true;
        }
        t.backpropagate(root, 1.0);
        assert!(!t.node(root).locked);
    }

    #[test]
    fn select_leaf_descends_to_an_unexpanded_node() {
        let g = tail_recursive();
        let mut t = tree(&g, false);
        let root = t.root();
        assert_eq!(t.select_leaf(root), root);

        t.populate_children(&g, root).unwrap();
        let leaf = t.select_leaf(root);
        assert_ne!(leaf, root);
        assert!(t.node(leaf).is_leaf());
    }

    #[test]
    fn children_mirror_the_budget_valid_grammar_choices() {
        let g = tail_recursive();
        // Budget 1: only the base case fits.
        let mut t = SearchTree::new(
            &g,
            1,
            0,
            Bias::new(BiasConfig::default()).unwrap(),
            2.0,
            10,
            false,
        )
        .unwrap();
        let root = t.root();
        let added = t.populate_children(&g, root).unwrap();
        assert_eq!(added, 1);
        let child = t.node(root).children[0];
        assert!(t.node(child).is_terminal());
        assert_eq!(t.node(child).derivation.text(), "b");
    }
}
