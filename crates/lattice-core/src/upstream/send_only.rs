//! Broadcast-only endpoints.
//!
//! A send-only node has a single unary transport and a reduced lifecycle: it is verified
//! once at startup (retrying with backoff until the chain ID matches) and is never health
//! checked afterwards.

use std::{sync::Arc, time::Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    backoff::Backoff,
    errors::NodeError,
    node::NodeSettings,
    node_state::NodeState,
    transport::{Connector, RpcTransport},
};
use crate::{
    metrics::PoolMetrics,
    types::{BatchElem, ChainId},
    utils::quantity::value_as_u64,
};

struct SendOnlyInner {
    state: NodeState,
    started: bool,
    transport: Option<Arc<dyn RpcTransport>>,
    verify_task: Option<JoinHandle<()>>,
}

pub struct SendOnlyNode {
    name: String,
    chain_id: ChainId,
    connector: Arc<dyn Connector>,
    settings: NodeSettings,
    metrics: PoolMetrics,
    stop: CancellationToken,
    inner: Mutex<SendOnlyInner>,
}

impl std::fmt::Debug for SendOnlyNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendOnlyNode")
            .field("name", &self.name)
            .field("chain_id", &self.chain_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SendOnlyNode {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        chain_id: ChainId,
        connector: Arc<dyn Connector>,
        settings: NodeSettings,
        metrics: PoolMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            chain_id,
            connector,
            settings,
            metrics,
            stop: CancellationToken::new(),
            inner: Mutex::new(SendOnlyInner {
                state: NodeState::Undialed,
                started: false,
                transport: None,
                verify_task: None,
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn configured_chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// `Undialed` until the first verification attempt has completed.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    /// Connects the transport and spawns the verification loop.
    ///
    /// # Errors
    /// Returns an error if the node was already started or closed, or if the transport
    /// cannot be created.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        {
            let mut inner = self.inner.lock();
            if inner.started || inner.state == NodeState::Closed {
                return Err(NodeError::InvalidState {
                    name: self.name.clone(),
                    state: inner.state,
                });
            }
            inner.started = true;
        }

        let connection = self.connector.connect().await;
        self.metrics.dial(&self.name, connection.is_ok());
        let connection = connection?;
        let transport: Arc<dyn RpcTransport> = match (connection.secondary, connection.primary) {
            (Some(secondary), primary) => {
                if let Some(primary) = primary {
                    primary.close();
                }
                secondary
            }
            (None, Some(primary)) => primary.as_unary(),
            (None, None) => {
                return Err(NodeError::ConnectionFailed("no transport for send-only node".into()))
            }
        };

        let mut inner = self.inner.lock();
        if inner.state == NodeState::Closed {
            transport.close();
            return Err(NodeError::Closed);
        }
        inner.transport = Some(transport);
        inner.verify_task = Some(tokio::spawn(Arc::clone(self).verify_loop()));
        Ok(())
    }

    fn set_state(&self, state: NodeState) {
        let mut inner = self.inner.lock();
        if inner.state == NodeState::Closed || inner.state == state {
            return;
        }
        inner.state = state;
        self.metrics.transition(&self.name, state);
    }

    async fn verify_loop(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.settings.backoff);
        loop {
            match self.remote_chain_id().await {
                Ok(actual) if actual == self.chain_id => {
                    self.metrics.verify(&self.name, true);
                    self.set_state(NodeState::Alive);
                    info!(node = %self.name, "Sendonly RPC Node is online");
                    return;
                }
                Ok(actual) => {
                    self.metrics.verify(&self.name, false);
                    self.set_state(NodeState::Unreachable);
                    error!(
                        node = %self.name,
                        expected = self.chain_id,
                        actual,
                        "sendonly rpc chain id does not match local chain id"
                    );
                }
                Err(e) => {
                    if self.stop.is_cancelled() {
                        return;
                    }
                    self.metrics.verify(&self.name, false);
                    self.set_state(NodeState::Unreachable);
                    warn!(node = %self.name, error = %e, "Verify failed");
                }
            }

            tokio::select! {
                biased;
                () = self.stop.cancelled() => return,
                () = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
    }

    async fn remote_chain_id(&self) -> Result<ChainId, NodeError> {
        let v = self.unguarded_call("eth_chainId", json!([])).await?;
        value_as_u64(&v).map_err(|e| NodeError::InvalidResponse(e.to_string()))
    }

    fn transport(&self) -> Result<Arc<dyn RpcTransport>, NodeError> {
        self.inner
            .lock()
            .transport
            .clone()
            .ok_or_else(|| NodeError::ConnectionFailed("send-only node is not dialed".into()))
    }

    async fn unguarded_call(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        let transport = self.transport()?;
        tokio::select! {
            biased;
            () = self.stop.cancelled() => Err(NodeError::Cancelled),
            res = tokio::time::timeout(self.settings.request_timeout, transport.call(method, params)) => {
                res.unwrap_or(Err(NodeError::Timeout))
            }
        }
    }

    fn alive_transport(&self) -> Result<Arc<dyn RpcTransport>, NodeError> {
        let inner = self.inner.lock();
        match (&inner.transport, inner.state) {
            (Some(t), NodeState::Alive) => Ok(Arc::clone(t)),
            (_, state) => Err(NodeError::InvalidState { name: self.name.clone(), state }),
        }
    }

    /// Submits a signed raw transaction.
    ///
    /// # Errors
    /// Fails with `NodeError::InvalidState` unless the node is `Alive`.
    pub async fn send_transaction(&self, raw_tx: &str) -> Result<(), NodeError> {
        let transport = self.alive_transport()?;
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            () = self.stop.cancelled() => Err(NodeError::Cancelled),
            res = tokio::time::timeout(
                self.settings.request_timeout,
                transport.call("eth_sendRawTransaction", json!([raw_tx])),
            ) => res.unwrap_or(Err(NodeError::Timeout)).map(|_| ()),
        };
        self.metrics.call(&self.name, "eth_sendRawTransaction", result.is_ok(), started.elapsed());
        result
    }

    pub async fn batch_call_context(&self, batch: &mut [BatchElem]) -> Result<(), NodeError> {
        let transport = self.alive_transport()?;
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            () = self.stop.cancelled() => Err(NodeError::Cancelled),
            res = tokio::time::timeout(self.settings.request_timeout, transport.batch_call(batch)) => {
                res.unwrap_or(Err(NodeError::Timeout))
            }
        };
        self.metrics.call(&self.name, "batch", result.is_ok(), started.elapsed());
        result
    }

    /// Stops verification and releases the transport. Idempotent.
    pub async fn close(&self) {
        let (task, transport) = {
            let mut inner = self.inner.lock();
            if inner.state == NodeState::Closed {
                return;
            }
            inner.state = NodeState::Closed;
            (inner.verify_task.take(), inner.transport.take())
        };
        self.stop.cancel();
        self.metrics.transition(&self.name, NodeState::Closed);
        if let Some(transport) = transport {
            transport.close();
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!(node = %self.name, "send-only node closed");
    }
}
