use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use super::{alive, NodeSelector, SelectableNode};

/// Rotates through the alive nodes with a shared counter.
pub struct RoundRobin<N> {
    nodes: Arc<Vec<Arc<N>>>,
    counter: AtomicUsize,
}

impl<N> RoundRobin<N> {
    #[must_use]
    pub fn new(nodes: Arc<Vec<Arc<N>>>) -> Self {
        Self { nodes, counter: AtomicUsize::new(0) }
    }
}

impl<N: SelectableNode> NodeSelector<N> for RoundRobin<N> {
    fn select(&self) -> Option<Arc<N>> {
        let live = alive(&self.nodes);
        if live.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % live.len();
        Some(Arc::clone(live[idx].1))
    }

    fn name(&self) -> &'static str {
        "RoundRobin"
    }
}
