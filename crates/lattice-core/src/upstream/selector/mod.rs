//! Node selection policies for read dispatch.
//!
//! Every selector only ever returns an `Alive` node and returns `None` when no node is
//! alive. Selectors see nodes through [`SelectableNode`], so they can be exercised without
//! a live pool.
//!
//! | Mode | Picks |
//! |------|-------|
//! | [`RoundRobin`] | next alive node in rotation |
//! | [`PriorityLevel`] | rotation within the best (lowest) `order` tier |
//! | [`HighestHead`] | highest block number, sticky on ties |
//! | [`TotalDifficulty`] | highest total difficulty, sticky on ties |

mod highest_head;
mod priority_level;
mod round_robin;
mod total_difficulty;

pub use highest_head::HighestHead;
pub use priority_level::PriorityLevel;
pub use round_robin::RoundRobin;
pub use total_difficulty::TotalDifficulty;

use std::sync::Arc;

use parking_lot::Mutex;

use super::{node::Node, node_state::NodeState};
use crate::{config::SelectionMode, types::ChainInfo};

/// View of a node that selectors need.
pub trait SelectableNode: Send + Sync {
    fn name(&self) -> &str;
    fn order(&self) -> i32;
    fn state_and_latest(&self) -> (NodeState, ChainInfo);
}

impl SelectableNode for Node {
    fn name(&self) -> &str {
        Node::name(self)
    }

    fn order(&self) -> i32 {
        Node::order(self)
    }

    fn state_and_latest(&self) -> (NodeState, ChainInfo) {
        Node::state_and_latest(self)
    }
}

pub trait NodeSelector<N: SelectableNode>: Send + Sync {
    fn select(&self) -> Option<Arc<N>>;
    fn name(&self) -> &'static str;
}

/// Builds the selector for `mode` over a fixed node list.
#[must_use]
pub fn new_node_selector<N: SelectableNode + 'static>(
    mode: SelectionMode,
    nodes: Arc<Vec<Arc<N>>>,
) -> Arc<dyn NodeSelector<N>> {
    match mode {
        SelectionMode::RoundRobin => Arc::new(RoundRobin::new(nodes)),
        SelectionMode::PriorityLevel => Arc::new(PriorityLevel::new(nodes)),
        SelectionMode::HighestHead => Arc::new(HighestHead::new(nodes)),
        SelectionMode::TotalDifficulty => Arc::new(TotalDifficulty::new(nodes)),
    }
}

/// Alive nodes with their index and latest position.
fn alive<N: SelectableNode>(nodes: &[Arc<N>]) -> Vec<(usize, &Arc<N>, ChainInfo)> {
    nodes
        .iter()
        .enumerate()
        .filter_map(|(idx, node)| {
            let (state, info) = node.state_and_latest();
            (state == NodeState::Alive).then_some((idx, node, info))
        })
        .collect()
}

/// Highest `key` wins. Among ties the previous winner is kept if it is still tied,
/// otherwise the lowest `order` (then the lowest index) wins.
fn sticky_select<N, K, F>(nodes: &[Arc<N>], last: &Mutex<Option<Arc<N>>>, key: F) -> Option<Arc<N>>
where
    N: SelectableNode,
    K: Ord,
    F: Fn(&ChainInfo) -> K,
{
    let candidates = alive(nodes);
    let best = candidates.iter().map(|(_, _, info)| key(info)).max()?;
    let tied: Vec<_> = candidates.iter().filter(|(_, _, info)| key(info) == best).collect();

    let mut last = last.lock();
    let winner = last
        .as_ref()
        .and_then(|prev| tied.iter().find(|(_, node, _)| Arc::ptr_eq(node, prev)))
        .or_else(|| tied.iter().min_by_key(|(idx, node, _)| (node.order(), *idx)))
        .map(|(_, node, _)| Arc::clone(node))?;
    *last = Some(Arc::clone(&winner));
    Some(winner)
}
