//! Background sweep over a pool's primary nodes.
//!
//! Nodes recover on their own once their monitor loop is running; the sweep only covers
//! the gaps: nodes that were never started, `Dialed` nodes left without a monitor, and
//! looped states whose monitor task has died.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, error, warn};

use super::{errors::PoolError, node::Node, node_state::NodeState};
use crate::metrics::PoolMetrics;

/// Alive/total primary node counts at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHealth {
    pub alive: usize,
    pub total: usize,
}

impl PoolHealth {
    #[must_use]
    pub fn of(nodes: &[Arc<Node>]) -> Self {
        let alive = nodes.iter().filter(|n| n.state() == NodeState::Alive).count();
        Self { alive, total: nodes.len() }
    }

    /// # Errors
    /// Returns `PoolError::NoPrimaryNodesAvailable` when no primary node is alive.
    pub fn check(self) -> Result<(), PoolError> {
        if self.alive == 0 {
            return Err(PoolError::NoPrimaryNodesAvailable { alive: self.alive, total: self.total });
        }
        Ok(())
    }
}

async fn revive_if_stalled(node: &Arc<Node>) {
    match node.state() {
        NodeState::Undialed => {
            if let Err(e) = node.start().await {
                debug!(node = %node.name(), error = %e, "sweep could not start node");
            }
        }
        NodeState::Dialed => node.verify_dialed().await,
        NodeState::Closed => {}
        state => {
            if node.respawn_monitor_if_finished() {
                warn!(node = %node.name(), %state, "monitor loop exited unexpectedly; restarted");
            }
        }
    }
}

/// Kicks every stalled node once, concurrently.
pub(crate) async fn sweep(nodes: &[Arc<Node>]) {
    join_all(nodes.iter().map(revive_if_stalled)).await;
}

/// Logs the pool's liveness and records the live node gauge.
pub(crate) fn report(nodes: &[Arc<Node>], metrics: &PoolMetrics) -> PoolHealth {
    let health = PoolHealth::of(nodes);
    metrics.live_nodes(health.alive);
    if health.alive == 0 {
        error!(
            alive = health.alive,
            total = health.total,
            "no primary nodes available: {}/{} nodes are alive",
            health.alive,
            health.total
        );
    } else if health.alive < health.total {
        warn!(
            alive = health.alive,
            total = health.total,
            "At least one primary node is dead: {}/{} nodes are alive",
            health.alive,
            health.total
        );
    }
    health
}
