//! Endpoint management: transports, nodes, their lifecycle and the pool.
//!
//! # Layers
//!
//! ```text
//! Pool ──► NodeSelector ──► Node ──► TransportRoute ──► RpcTransport / StreamingTransport
//!   │                        │
//!   │                        └─ lifecycle loop per state (alive, out of sync,
//!   │                           unreachable, invalid chain id)
//!   └─ SendOnlyNode (broadcast only)
//! ```
//!
//! Nodes move through [`NodeState`] on their own: each non-terminal state runs one
//! monitor loop that watches the endpoint and moves the node on. The [`Pool`] only dials
//! nodes, sweeps for stalled ones, and dispatches calls to whichever node the configured
//! selector picks.

pub mod backoff;
pub mod builder;
pub mod classifier;
pub mod errors;
pub mod health;
pub mod http_client;
pub mod lifecycle;
pub mod node;
pub mod node_state;
pub mod pool;
pub mod selector;
pub mod send_only;
pub mod subscription;
pub mod transport;
pub mod websocket;

pub use backoff::{Backoff, BackoffConfig};
pub use builder::{BuilderError, NodeSpec, PoolBuilder};
pub use classifier::{
    aggregate_tx_results, classify_send_error, AggregatedTxResult, SendError, SendErrorKind,
    SendTxReturnCode, TxOutcome,
};
pub use errors::{NodeError, PoolError};
pub use health::PoolHealth;
pub use http_client::{HttpClient, HttpClientConfig, HttpTransport};
pub use lifecycle::SyncCheck;
pub use node::{LiveNodesFn, Node, NodeSettings, Verification};
pub use node_state::NodeState;
pub use pool::Pool;
pub use selector::{new_node_selector, NodeSelector, SelectableNode};
pub use send_only::SendOnlyNode;
pub use subscription::{forward, prefix_errors, Subscription, SubscriptionHandle};
pub use transport::{
    Connection, Connector, RouteMode, RpcTransport, StreamingTransport, TransportRoute,
    WsHttpConnector,
};
pub use websocket::WsTransport;
