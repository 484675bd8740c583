use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use dashmap::DashMap;

use super::{alive, NodeSelector, SelectableNode};

/// Rotates within the best priority tier. Lower `order` is a better tier.
pub struct PriorityLevel<N> {
    nodes: Arc<Vec<Arc<N>>>,
    counters: DashMap<i32, AtomicUsize>,
}

impl<N> PriorityLevel<N> {
    #[must_use]
    pub fn new(nodes: Arc<Vec<Arc<N>>>) -> Self {
        Self { nodes, counters: DashMap::new() }
    }
}

impl<N: SelectableNode> NodeSelector<N> for PriorityLevel<N> {
    fn select(&self) -> Option<Arc<N>> {
        let live = alive(&self.nodes);
        let tier = live.iter().map(|(_, node, _)| node.order()).min()?;
        let tier_nodes: Vec<_> = live.iter().filter(|(_, node, _)| node.order() == tier).collect();

        let counter = self.counters.entry(tier).or_insert_with(|| AtomicUsize::new(0));
        let idx = counter.fetch_add(1, Ordering::Relaxed) % tier_nodes.len();
        Some(Arc::clone(tier_nodes[idx].1))
    }

    fn name(&self) -> &'static str {
        "PriorityLevel"
    }
}
