use std::sync::Arc;

use parking_lot::Mutex;

use super::{sticky_select, NodeSelector, SelectableNode};

/// Picks the alive node with the highest total difficulty. A node without a total
/// difficulty ranks below every node that has one.
pub struct TotalDifficulty<N> {
    nodes: Arc<Vec<Arc<N>>>,
    last: Mutex<Option<Arc<N>>>,
}

impl<N> TotalDifficulty<N> {
    #[must_use]
    pub fn new(nodes: Arc<Vec<Arc<N>>>) -> Self {
        Self { nodes, last: Mutex::new(None) }
    }
}

impl<N: SelectableNode> NodeSelector<N> for TotalDifficulty<N> {
    fn select(&self) -> Option<Arc<N>> {
        sticky_select(&self.nodes, &self.last, |info| info.total_difficulty)
    }

    fn name(&self) -> &'static str {
        "TotalDifficulty"
    }
}
