use std::sync::Arc;

use parking_lot::Mutex;

use super::{sticky_select, NodeSelector, SelectableNode};

/// Picks the alive node with the highest block number.
pub struct HighestHead<N> {
    nodes: Arc<Vec<Arc<N>>>,
    last: Mutex<Option<Arc<N>>>,
}

impl<N> HighestHead<N> {
    #[must_use]
    pub fn new(nodes: Arc<Vec<Arc<N>>>) -> Self {
        Self { nodes, last: Mutex::new(None) }
    }
}

impl<N: SelectableNode> NodeSelector<N> for HighestHead<N> {
    fn select(&self) -> Option<Arc<N>> {
        sticky_select(&self.nodes, &self.last, |info| info.block_number)
    }

    fn name(&self) -> &'static str {
        "HighestHead"
    }
}
