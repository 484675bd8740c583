use thiserror::Error;

use super::{
    classifier::{SendError, SendTxReturnCode},
    node_state::NodeState,
};
use crate::types::ChainId;

/// Errors produced by a single node or its transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NodeError {
    /// The call did not complete before its deadline.
    #[error("Request timeout")]
    Timeout,

    /// Failed to establish or keep a connection to the endpoint.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Non-2xx HTTP status from the secondary transport.
    #[error("HTTP error: {0}: {1}")]
    HttpError(u16, String),

    /// JSON-RPC error object returned by the endpoint.
    ///
    /// Rendered as the bare message so that send errors can be classified on it.
    #[error("{message}")]
    Rpc { code: i64, message: String },

    /// Response could not be parsed or had an unexpected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A push subscription reported an error.
    #[error("{0}")]
    Subscription(String),

    /// A push subscription ended without reporting an error.
    #[error("Subscription closed")]
    SubscriptionClosed,

    /// RPC methods are only served while the node is Alive.
    #[error("cannot execute RPC call on node {name} in state {state}")]
    InvalidState { name: String, state: NodeState },

    /// The remote endpoint serves a different chain.
    #[error("invalid chain ID: expected {expected}, got {actual}")]
    ChainIdMismatch { expected: ChainId, actual: ChainId },

    /// The call was aborted because the node left the state it was issued in.
    #[error("Request cancelled")]
    Cancelled,

    /// The node or transport has been closed.
    #[error("node is closed")]
    Closed,
}

impl NodeError {
    /// Returns `true` if retrying against the same or another endpoint may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout |
            Self::ConnectionFailed(_) |
            Self::Subscription(_) |
            Self::SubscriptionClosed |
            Self::InvalidState { .. } |
            Self::Cancelled => true,
            Self::HttpError(status, _) => (500..=599).contains(status) || *status == 429,
            Self::Rpc { .. } |
            Self::InvalidResponse(_) |
            Self::ChainIdMismatch { .. } |
            Self::Closed => false,
        }
    }

    /// Structural timeout check; never inspects the message text.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Message text the endpoint produced, without any local decoration.
    #[must_use]
    pub fn raw_message(&self) -> String {
        match self {
            Self::Rpc { message, .. } => message.clone(),
            Self::HttpError(_, body) => body.clone(),
            other => other.to_string(),
        }
    }

    /// Wraps the error text with `prefix`, keeping it a subscription-level error.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self::Subscription(format!("{prefix}: {self}"))
    }

    /// Returns a static string representation for metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::HttpError(..) => "http_error",
            Self::Rpc { .. } => "rpc_error",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Subscription(_) => "subscription_error",
            Self::SubscriptionClosed => "subscription_closed",
            Self::InvalidState { .. } => "invalid_state",
            Self::ChainIdMismatch { .. } => "chain_id_mismatch",
            Self::Cancelled => "cancelled",
            Self::Closed => "closed",
        }
    }
}

/// Errors surfaced by [`Pool`](super::pool::Pool) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolError {
    #[error("no available nodes for chain {chain_id}")]
    NoNodes { chain_id: ChainId },

    #[error("no live nodes for chain {chain_id}")]
    NoLiveNodes { chain_id: ChainId },

    #[error("no primary nodes available: {alive}/{total} nodes are alive")]
    NoPrimaryNodesAvailable { alive: usize, total: usize },

    #[error(
        "node {name} has configured chain ID {node_chain_id} which does not match pool configured chain ID of {pool_chain_id}"
    )]
    ChainIdMismatch { name: String, node_chain_id: ChainId, pool_chain_id: ChainId },

    #[error(
        "sendonly node {name} has configured chain ID {node_chain_id} which does not match pool configured chain ID of {pool_chain_id}"
    )]
    SendOnlyChainIdMismatch { name: String, node_chain_id: ChainId, pool_chain_id: ChainId },

    #[error("failed to start sendonly node {name}: {source}")]
    SendOnlyStart {
        name: String,
        #[source]
        source: NodeError,
    },

    #[error("aborted while broadcasting tx - pool is stopped")]
    Stopped,

    /// A broadcast ended in an error after aggregating every endpoint's reply.
    #[error("{error}")]
    Send { code: SendTxReturnCode, error: SendError },

    #[error(transparent)]
    Node(#[from] NodeError),
}

impl PoolError {
    /// The underlying node error, if this failure came from an endpoint.
    #[must_use]
    pub fn node_error(&self) -> Option<&NodeError> {
        match self {
            Self::Node(err) | Self::SendOnlyStart { source: err, .. } => Some(err),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoNodes { .. } => "no_nodes",
            Self::NoLiveNodes { .. } => "no_live_nodes",
            Self::NoPrimaryNodesAvailable { .. } => "no_primary_nodes",
            Self::ChainIdMismatch { .. } | Self::SendOnlyChainIdMismatch { .. } => {
                "chain_id_mismatch"
            }
            Self::SendOnlyStart { .. } => "sendonly_start",
            Self::Stopped => "stopped",
            Self::Send { code, .. } => code.as_str(),
            Self::Node(err) => err.as_str(),
        }
    }
}
