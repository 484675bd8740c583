use std::fmt;

/// Lifecycle state of a primary or send-only node.
///
/// Every state except `Undialed` and `Closed` owns exactly one monitor task. `Closed` is
/// absorbing: once reached, further transitions are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Constructed but never dialed.
    Undialed,
    /// Transport connected, chain ID not yet verified.
    Dialed,
    /// Remote endpoint reports a chain ID different from the configured one.
    InvalidChainId,
    /// Healthy and eligible for selection.
    Alive,
    /// Reachable but lagging behind the rest of the pool.
    OutOfSync,
    /// Transport failed; the node keeps redialing with backoff.
    Unreachable,
    /// Shut down for good.
    Closed,
}

impl NodeState {
    pub const ALL: [Self; 7] = [
        Self::Undialed,
        Self::Dialed,
        Self::InvalidChainId,
        Self::Alive,
        Self::OutOfSync,
        Self::Unreachable,
        Self::Closed,
    ];

    /// Operator-facing name, as reported by `Pool::node_states`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undialed => "Undialed",
            Self::Dialed => "Dialed",
            Self::InvalidChainId => "InvalidChainID",
            Self::Alive => "Alive",
            Self::OutOfSync => "OutOfSync",
            Self::Unreachable => "Unreachable",
            Self::Closed => "Closed",
        }
    }

    /// Lowercase label used for metrics.
    #[must_use]
    pub fn as_metric_str(&self) -> &'static str {
        match self {
            Self::Undialed => "undialed",
            Self::Dialed => "dialed",
            Self::InvalidChainId => "invalid_chain_id",
            Self::Alive => "alive",
            Self::OutOfSync => "out_of_sync",
            Self::Unreachable => "unreachable",
            Self::Closed => "closed",
        }
    }

    /// Returns `true` when the lifecycle table allows moving from `self` to `to`.
    ///
    /// `Closed` is reachable from every other state; nothing leads back to `Undialed`.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use NodeState::{Alive, Closed, Dialed, InvalidChainId, OutOfSync, Undialed, Unreachable};
        match to {
            Undialed => false,
            Dialed => matches!(self, Undialed | Unreachable),
            Alive => matches!(self, Dialed | InvalidChainId | OutOfSync),
            OutOfSync => self == Alive,
            Unreachable => matches!(self, Undialed | Dialed | Alive | OutOfSync | InvalidChainId),
            InvalidChainId => matches!(self, Dialed | OutOfSync),
            Closed => self != Closed,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
