//! A primary RPC node: one endpoint, its lifecycle state and its RPC surface.
//!
//! All mutable state sits behind one lock ([`NodeInner`]). A transition swaps the state,
//! cancels the previous per-state token (aborting in-flight calls and the previous
//! monitor loop), stops every registered subscription and spawns the monitor loop for the
//! new state, all before the lock is released. Readers therefore never observe a state
//! without its loop.
//!
//! Transitions requested by a loop carry that loop's token as the *owner*. Once the
//! state has moved on, the token is cancelled and the request is dropped, so a stale
//! loop cannot fight the current one.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    backoff::BackoffConfig,
    errors::NodeError,
    lifecycle::{self, SyncCheck},
    node_state::NodeState,
    subscription::{forward, Subscription, SubscriptionHandle},
    transport::{Connector, RouteMode, TransportRoute},
};
use crate::{
    config::{PoolConfig, SelectionMode},
    metrics::PoolMetrics,
    types::{BatchElem, ChainId, ChainInfo, Head},
    utils::{
        quantity::{value_as_u128, value_as_u64, QuantityError},
        BlockRef, BlockTag,
    },
};

/// Returns the pool's live node count and the best [`ChainInfo`] among live nodes.
pub type LiveNodesFn = Arc<dyn Fn() -> (usize, ChainInfo) + Send + Sync>;

/// Health checking knobs shared by every node of a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSettings {
    pub poll_interval: Duration,
    pub poll_failure_threshold: u32,
    pub no_new_heads_threshold: Duration,
    pub sync_threshold: u32,
    pub selection_mode: SelectionMode,
    pub request_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for NodeSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            poll_failure_threshold: config.poll_failure_threshold,
            no_new_heads_threshold: config.no_new_heads_threshold(),
            sync_threshold: config.sync_threshold,
            selection_mode: config.selection_mode,
            request_timeout: config.request_timeout(),
            backoff: config.backoff(),
        }
    }
}

/// Outcome of comparing the remote chain ID against the configured one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Mismatch { actual: ChainId },
    Failed(NodeError),
}

struct NodeInner {
    state: NodeState,
    route: Option<TransportRoute>,
    state_token: CancellationToken,
    next_subscription_id: u64,
    subscriptions: Vec<(u64, SubscriptionHandle)>,
    alive_loop_sub: Option<u64>,
    monitor: Option<JoinHandle<()>>,
    chain_info: ChainInfo,
}

impl NodeInner {
    fn stop_subscriptions(&mut self) {
        for (_, handle) in self.subscriptions.drain(..) {
            handle.request_stop();
        }
        self.alive_loop_sub = None;
    }
}

pub struct Node {
    name: String,
    index: usize,
    order: i32,
    chain_id: ChainId,
    route_mode: RouteMode,
    connector: Arc<dyn Connector>,
    settings: NodeSettings,
    metrics: PoolMetrics,
    live_nodes: OnceLock<LiveNodesFn>,
    starting: AtomicBool,
    inner: Mutex<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("order", &self.order)
            .field("chain_id", &self.chain_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Creates an undialed node.
    ///
    /// `index` is the node's position in the pool and breaks selection ties together with
    /// `order`.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        index: usize,
        order: i32,
        chain_id: ChainId,
        route_mode: RouteMode,
        connector: Arc<dyn Connector>,
        settings: NodeSettings,
        metrics: PoolMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            index,
            order,
            chain_id,
            route_mode,
            connector,
            settings,
            metrics,
            live_nodes: OnceLock::new(),
            starting: AtomicBool::new(false),
            inner: Mutex::new(NodeInner {
                state: NodeState::Undialed,
                route: None,
                state_token: CancellationToken::new(),
                next_subscription_id: 0,
                subscriptions: Vec::new(),
                alive_loop_sub: None,
                monitor: None,
                chain_info: ChainInfo::default(),
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn order(&self) -> i32 {
        self.order
    }

    #[must_use]
    pub fn configured_chain_id(&self) -> ChainId {
        self.chain_id
    }

    #[must_use]
    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn chain_info(&self) -> ChainInfo {
        self.inner.lock().chain_info
    }

    /// State and latest position, read under one lock acquisition.
    #[must_use]
    pub fn state_and_latest(&self) -> (NodeState, ChainInfo) {
        let inner = self.inner.lock();
        (inner.state, inner.chain_info)
    }

    /// Number of live subscriptions registered on this node.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.iter().filter(|(_, h)| !h.has_exited()).count()
    }

    /// Whether a monitor loop is attached and still running.
    #[must_use]
    pub fn has_running_monitor(&self) -> bool {
        self.inner.lock().monitor.as_ref().is_some_and(|m| !m.is_finished())
    }

    /// Installs the pool callback. Only the first call has an effect.
    pub fn set_live_nodes_fn(&self, f: LiveNodesFn) {
        let _ = self.live_nodes.set(f);
    }

    /// Live node count reported by the pool, `0` without a pool.
    pub(crate) fn live_count(&self) -> usize {
        self.live_nodes.get().map_or(0, |f| f().0)
    }

    /// Whether this node trails the pool by more than the sync threshold, along with the
    /// pool's live node count.
    ///
    /// Returns `(false, 0)` when no pool is attached or the threshold is disabled.
    pub(crate) fn sync_status(&self, number: i64, total_difficulty: Option<u128>) -> (bool, usize) {
        let Some(live_nodes) = self.live_nodes.get() else { return (false, 0) };
        if self.settings.sync_threshold == 0 {
            return (false, 0);
        }
        let (live, highest) = live_nodes();
        let threshold = self.settings.sync_threshold;
        let out_of_sync = if self.settings.selection_mode == SelectionMode::TotalDifficulty {
            highest.total_difficulty.is_some_and(|best| {
                total_difficulty.unwrap_or(0) < best.saturating_sub(u128::from(threshold))
            })
        } else {
            number < highest.block_number.saturating_sub(i64::from(threshold))
        };
        (out_of_sync, live)
    }

    /// Updates the latest position from a received head.
    pub(crate) fn record_head(&self, head: &Head) {
        let info = {
            let mut inner = self.inner.lock();
            if head.number > inner.chain_info.block_number {
                inner.chain_info.block_number = head.number;
            }
            if head.total_difficulty > inner.chain_info.total_difficulty {
                inner.chain_info.total_difficulty = head.total_difficulty;
            }
            inner.chain_info
        };
        self.metrics.seen_head(&self.name, info.block_number, info.total_difficulty);
    }

    // ---- lifecycle ----

    /// Dials and verifies the node, then hands it to its monitor loop.
    ///
    /// Dial and verification failures are not errors: the node moves to `Unreachable` or
    /// `InvalidChainId` and recovers on its own.
    ///
    /// # Errors
    /// Returns `NodeError::InvalidState` if the node was already started or closed.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        let token = {
            let inner = self.inner.lock();
            if inner.state != NodeState::Undialed {
                return Err(self.invalid_state(inner.state));
            }
            inner.state_token.clone()
        };
        if self.starting.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.start_owned(&token).await;
        self.starting.store(false, Ordering::Release);
        Ok(())
    }

    async fn start_owned(self: &Arc<Self>, token: &CancellationToken) {
        if let Err(e) = self.redial(token).await {
            if !token.is_cancelled() {
                warn!(node = %self.name, error = %e, "Dial failed: Node is unreachable");
                self.transition_owned(token, NodeState::Unreachable);
            }
            return;
        }
        self.finish_verification(token).await;
    }

    /// Verifies a `Dialed` node that has no monitor and moves it on.
    pub(crate) async fn verify_dialed(self: &Arc<Self>) {
        let token = {
            let inner = self.inner.lock();
            if inner.state != NodeState::Dialed || inner.monitor.is_some() {
                return;
            }
            inner.state_token.clone()
        };
        self.finish_verification(&token).await;
    }

    async fn finish_verification(self: &Arc<Self>, token: &CancellationToken) {
        match self.verify_chain_id(token).await {
            Verification::Verified => self.transition_owned(token, NodeState::Alive),
            Verification::Mismatch { actual } => {
                error!(
                    node = %self.name,
                    expected = self.chain_id,
                    actual,
                    "rpc node has the wrong chain id"
                );
                self.transition_owned(token, NodeState::InvalidChainId);
            }
            Verification::Failed(e) => {
                if token.is_cancelled() {
                    return;
                }
                error!(node = %self.name, error = %e, "Verify failed");
                self.transition_owned(token, NodeState::Unreachable);
            }
        }
    }

    /// Restarts the loop of a node whose monitor died while the node stayed in a looped
    /// state. Returns `true` if a loop was respawned.
    pub(crate) fn respawn_monitor_if_finished(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock();
        let looped = matches!(
            inner.state,
            NodeState::Alive | NodeState::OutOfSync | NodeState::Unreachable | NodeState::InvalidChainId
        );
        let finished = inner.monitor.as_ref().is_some_and(JoinHandle::is_finished);
        if !looped || !finished {
            return false;
        }
        let state = inner.state;
        let check = SyncCheck::NewerThan(inner.chain_info.block_number);
        self.rotate_and_spawn(&mut inner, state, check);
        true
    }

    /// Connects a fresh transport route and installs it.
    ///
    /// `Undialed` and `Unreachable` nodes become `Dialed`; `OutOfSync` nodes keep their
    /// state. The owner's token is not rotated.
    ///
    /// # Errors
    /// Fails if the connection fails, the owner token was cancelled, or the node closed.
    pub(crate) async fn redial(&self, owner: &CancellationToken) -> Result<(), NodeError> {
        let connected = tokio::select! {
            biased;
            () = owner.cancelled() => Err(NodeError::Cancelled),
            res = self.connector.connect() => {
                res.and_then(|conn| TransportRoute::resolve(self.route_mode, conn))
            }
        };
        let route = match connected {
            Ok(route) => route,
            Err(e) => {
                self.metrics.dial(&self.name, false);
                return Err(e);
            }
        };

        let mut inner = self.inner.lock();
        if inner.state == NodeState::Closed {
            route.close();
            return Err(NodeError::Closed);
        }
        if owner.is_cancelled() {
            route.close();
            return Err(NodeError::Cancelled);
        }
        if let Some(old) = inner.route.replace(route) {
            old.close();
        }
        self.metrics.dial(&self.name, true);
        match inner.state {
            NodeState::Undialed | NodeState::Unreachable => {
                debug!(node = %self.name, from = %inner.state, "rpc node dialed");
                inner.state = NodeState::Dialed;
                self.metrics.transition(&self.name, NodeState::Dialed);
            }
            NodeState::OutOfSync => {}
            other => {
                debug!(node = %self.name, state = %other, "redialed without state change");
            }
        }
        Ok(())
    }

    /// Compares `eth_chainId` on the current route against the configured chain ID.
    ///
    /// Runs regardless of the node's state.
    pub(crate) async fn verify_chain_id(&self, owner: &CancellationToken) -> Verification {
        let result = self
            .unguarded_call(owner, "eth_chainId", json!([]), self.settings.request_timeout)
            .await
            .and_then(|v| decode(&v, value_as_u64));
        let verification = match result {
            Ok(actual) if actual == self.chain_id => Verification::Verified,
            Ok(actual) => Verification::Mismatch { actual },
            Err(e) => Verification::Failed(e),
        };
        self.metrics.verify(&self.name, verification == Verification::Verified);
        verification
    }

    /// `web3_clientVersion` liveness probe used by the alive loop.
    pub(crate) async fn poll_client_version(
        &self,
        owner: &CancellationToken,
        timeout: Duration,
    ) -> Result<String, NodeError> {
        let result = self
            .unguarded_call(owner, "web3_clientVersion", json!([]), timeout)
            .await
            .and_then(|v| as_string(&v));
        self.metrics.poll(&self.name, result.is_ok());
        result
    }

    async fn unguarded_call(
        &self,
        owner: &CancellationToken,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, NodeError> {
        let unary = self
            .inner
            .lock()
            .route
            .as_ref()
            .map(TransportRoute::unary)
            .ok_or_else(|| NodeError::ConnectionFailed("node is not dialed".into()))?;
        tokio::select! {
            biased;
            () = owner.cancelled() => Err(NodeError::Cancelled),
            res = tokio::time::timeout(timeout, unary.call(method, params)) => {
                res.unwrap_or(Err(NodeError::Timeout))
            }
        }
    }

    /// Opens a `newHeads` subscription on the current route without the `Alive` guard and
    /// registers it on behalf of `owner`.
    pub(crate) async fn subscribe_heads_owned(
        &self,
        owner: &CancellationToken,
        alive_loop: bool,
    ) -> Result<Subscription<Head>, NodeError> {
        let route = self
            .inner
            .lock()
            .route
            .clone()
            .ok_or_else(|| NodeError::ConnectionFailed("node is not dialed".into()))?;
        let sub = tokio::select! {
            biased;
            () = owner.cancelled() => return Err(NodeError::Cancelled),
            sub = self.open_heads(&route) => sub?,
        };
        self.register_subscription(sub.handle().clone(), owner, alive_loop)?;
        Ok(sub)
    }

    async fn open_heads(&self, route: &TransportRoute) -> Result<Subscription<Head>, NodeError> {
        let streaming = route.streaming();
        let raw = tokio::time::timeout(
            self.settings.request_timeout,
            streaming.subscribe(json!(["newHeads"])),
        )
        .await
        .map_err(|_| NodeError::Timeout)??;

        let chain_id = self.chain_id;
        let prefix = format!("primary websocket ({})", streaming.uri());
        Ok(forward(
            raw,
            move |v: Value| Head::from_json(&v).ok().map(|h| h.with_chain_id(chain_id)),
            move |e| e.with_prefix(&prefix),
        ))
    }

    fn register_subscription(
        &self,
        handle: SubscriptionHandle,
        owner: &CancellationToken,
        alive_loop: bool,
    ) -> Result<(), NodeError> {
        let mut inner = self.inner.lock();
        if owner.is_cancelled() || inner.state == NodeState::Closed {
            handle.request_stop();
            return Err(NodeError::Cancelled);
        }
        inner.subscriptions.retain(|(_, h)| !h.has_exited());
        let id = inner.next_subscription_id;
        inner.next_subscription_id += 1;
        inner.subscriptions.push((id, handle));
        if alive_loop {
            inner.alive_loop_sub = Some(id);
        }
        Ok(())
    }

    /// Stops every subscription except the one feeding the alive loop.
    pub fn unsubscribe_all_except_alive_loop(&self) {
        let mut inner = self.inner.lock();
        let keep = inner.alive_loop_sub;
        inner.subscriptions.retain(|(id, handle)| {
            if Some(*id) == keep {
                true
            } else {
                handle.request_stop();
                false
            }
        });
    }

    /// Moves the node to `to` and starts that state's monitor loop.
    ///
    /// Entering `OutOfSync` this way waits for a head newer than the current one.
    ///
    /// # Panics
    /// Panics with `cannot transition from {from} to {to}` if the lifecycle forbids the
    /// move. Transitions on a closed node are ignored.
    pub fn transition_to(self: &Arc<Self>, to: NodeState) {
        let mut inner = self.inner.lock();
        let check = SyncCheck::NewerThan(inner.chain_info.block_number);
        self.institute(&mut inner, to, check);
    }

    /// Transition requested by the holder of `owner`; dropped if the state has moved on.
    pub(crate) fn transition_owned(self: &Arc<Self>, owner: &CancellationToken, to: NodeState) {
        let mut inner = self.inner.lock();
        if owner.is_cancelled() {
            return;
        }
        let check = SyncCheck::NewerThan(inner.chain_info.block_number);
        self.institute(&mut inner, to, check);
    }

    pub(crate) fn declare_out_of_sync(self: &Arc<Self>, owner: &CancellationToken, check: SyncCheck) {
        let mut inner = self.inner.lock();
        if owner.is_cancelled() {
            return;
        }
        self.institute(&mut inner, NodeState::OutOfSync, check);
    }

    fn institute(self: &Arc<Self>, inner: &mut NodeInner, to: NodeState, check: SyncCheck) {
        let from = inner.state;
        if from == NodeState::Closed {
            return;
        }
        if !from.can_transition_to(to) {
            panic!("cannot transition from {from} to {to}");
        }
        info!(node = %self.name, %from, %to, "rpc node state transition");
        if to == NodeState::Closed {
            inner.state_token.cancel();
            inner.stop_subscriptions();
            inner.state = to;
            self.metrics.transition(&self.name, to);
            return;
        }
        self.rotate_and_spawn(inner, to, check);
    }

    fn rotate_and_spawn(self: &Arc<Self>, inner: &mut NodeInner, to: NodeState, check: SyncCheck) {
        inner.state_token.cancel();
        let token = CancellationToken::new();
        inner.state_token = token.clone();
        inner.stop_subscriptions();
        inner.state = to;
        self.metrics.transition(&self.name, to);

        let node = Arc::clone(self);
        inner.monitor = match to {
            NodeState::Alive => Some(tokio::spawn(lifecycle::alive_loop(node, token))),
            NodeState::OutOfSync => {
                Some(tokio::spawn(lifecycle::out_of_sync_loop(node, token, check)))
            }
            NodeState::Unreachable => Some(tokio::spawn(lifecycle::unreachable_loop(node, token))),
            NodeState::InvalidChainId => {
                Some(tokio::spawn(lifecycle::invalid_chain_id_loop(node, token)))
            }
            NodeState::Undialed | NodeState::Dialed | NodeState::Closed => None,
        };
    }

    /// Closes the node: stops its loop and subscriptions and releases the transport.
    /// Idempotent.
    pub async fn close(&self) {
        let (monitor, handles) = {
            let mut inner = self.inner.lock();
            if inner.state == NodeState::Closed {
                return;
            }
            inner.state_token.cancel();
            let handles: Vec<_> = inner.subscriptions.drain(..).map(|(_, h)| h).collect();
            inner.alive_loop_sub = None;
            inner.state = NodeState::Closed;
            if let Some(route) = inner.route.take() {
                route.close();
            }
            (inner.monitor.take(), handles)
        };
        self.metrics.transition(&self.name, NodeState::Closed);
        for handle in handles {
            handle.unsubscribe().await;
        }
        if let Some(monitor) = monitor {
            monitor.abort();
            let _ = monitor.await;
        }
        debug!(node = %self.name, "rpc node closed");
    }

    // ---- RPC surface (Alive only) ----

    fn invalid_state(&self, state: NodeState) -> NodeError {
        NodeError::InvalidState { name: self.name.clone(), state }
    }

    fn alive_route(&self) -> Result<(TransportRoute, CancellationToken), NodeError> {
        let inner = self.inner.lock();
        match (&inner.route, inner.state) {
            (Some(route), NodeState::Alive) => Ok((route.clone(), inner.state_token.clone())),
            (_, state) => Err(self.invalid_state(state)),
        }
    }

    async fn with_alive<T, F, Fut>(&self, method: &str, f: F) -> Result<T, NodeError>
    where
        F: FnOnce(TransportRoute) -> Fut,
        Fut: Future<Output = Result<T, NodeError>>,
    {
        let (route, token) = self.alive_route()?;
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(NodeError::Cancelled),
            res = tokio::time::timeout(self.settings.request_timeout, f(route)) => {
                res.unwrap_or(Err(NodeError::Timeout))
            }
        };
        self.metrics.call(&self.name, method, result.is_ok(), started.elapsed());
        result
    }

    /// Raw JSON-RPC call.
    ///
    /// # Errors
    /// Fails with `NodeError::InvalidState` unless the node is `Alive`, and with the
    /// transport's error otherwise.
    pub async fn call_context(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        self.with_alive(method, |route| async move { route.unary().call(method, params).await })
            .await
    }

    /// Raw batch call; per-element results are written into `batch`.
    pub async fn batch_call_context(&self, batch: &mut [BatchElem]) -> Result<(), NodeError> {
        self.with_alive("batch", |route| async move { route.unary().batch_call(batch).await })
            .await
    }

    pub async fn chain_id(&self) -> Result<ChainId, NodeError> {
        let v = self.call_context("eth_chainId", json!([])).await?;
        decode(&v, value_as_u64)
    }

    pub async fn block_number(&self) -> Result<u64, NodeError> {
        let v = self.call_context("eth_blockNumber", json!([])).await?;
        decode(&v, value_as_u64)
    }

    pub async fn balance_at(&self, address: &str, block: BlockRef) -> Result<u128, NodeError> {
        let v = self.call_context("eth_getBalance", json!([address, block.to_param()])).await?;
        decode(&v, value_as_u128)
    }

    pub async fn code_at(&self, address: &str, block: BlockRef) -> Result<String, NodeError> {
        let v = self.call_context("eth_getCode", json!([address, block.to_param()])).await?;
        as_string(&v)
    }

    pub async fn nonce_at(&self, address: &str, block: BlockRef) -> Result<u64, NodeError> {
        let v = self
            .call_context("eth_getTransactionCount", json!([address, block.to_param()]))
            .await?;
        decode(&v, value_as_u64)
    }

    pub async fn pending_nonce_at(&self, address: &str) -> Result<u64, NodeError> {
        self.nonce_at(address, BlockRef::Tag(BlockTag::Pending)).await
    }

    pub async fn filter_logs(&self, filter: Value) -> Result<Vec<Value>, NodeError> {
        match self.call_context("eth_getLogs", json!([filter])).await? {
            Value::Array(logs) => Ok(logs),
            other => Err(NodeError::InvalidResponse(format!("expected log array, got {other}"))),
        }
    }

    /// `None` when the receipt is not (yet) known.
    pub async fn transaction_receipt(&self, hash: &str) -> Result<Option<Value>, NodeError> {
        let v = self.call_context("eth_getTransactionReceipt", json!([hash])).await?;
        Ok(non_null(v))
    }

    pub async fn transaction_by_hash(&self, hash: &str) -> Result<Option<Value>, NodeError> {
        let v = self.call_context("eth_getTransactionByHash", json!([hash])).await?;
        Ok(non_null(v))
    }

    pub async fn header_by_number(&self, block: BlockRef) -> Result<Option<Head>, NodeError> {
        let v = self.call_context("eth_getBlockByNumber", json!([block.to_param(), false])).await?;
        non_null(v).map(|v| Head::from_json(&v).map(|h| h.with_chain_id(self.chain_id))).transpose()
    }

    pub async fn block_by_number(
        &self,
        block: BlockRef,
        full_transactions: bool,
    ) -> Result<Option<Value>, NodeError> {
        let v = self
            .call_context("eth_getBlockByNumber", json!([block.to_param(), full_transactions]))
            .await?;
        Ok(non_null(v))
    }

    pub async fn block_by_hash(
        &self,
        hash: &str,
        full_transactions: bool,
    ) -> Result<Option<Value>, NodeError> {
        let v = self.call_context("eth_getBlockByHash", json!([hash, full_transactions])).await?;
        Ok(non_null(v))
    }

    pub async fn estimate_gas(&self, call: Value) -> Result<u64, NodeError> {
        let v = self.call_context("eth_estimateGas", json!([call])).await?;
        decode(&v, value_as_u64)
    }

    pub async fn suggest_gas_price(&self) -> Result<u128, NodeError> {
        let v = self.call_context("eth_gasPrice", json!([])).await?;
        decode(&v, value_as_u128)
    }

    pub async fn suggest_gas_tip_cap(&self) -> Result<u128, NodeError> {
        let v = self.call_context("eth_maxPriorityFeePerGas", json!([])).await?;
        decode(&v, value_as_u128)
    }

    pub async fn call_contract(&self, call: Value, block: BlockRef) -> Result<String, NodeError> {
        let v = self.call_context("eth_call", json!([call, block.to_param()])).await?;
        as_string(&v)
    }

    pub async fn client_version(&self) -> Result<String, NodeError> {
        let v = self.call_context("web3_clientVersion", json!([])).await?;
        as_string(&v)
    }

    /// Submits a signed raw transaction (`0x`-prefixed hex).
    pub async fn send_transaction(&self, raw_tx: &str) -> Result<(), NodeError> {
        self.call_context("eth_sendRawTransaction", json!([raw_tx])).await.map(|_| ())
    }

    /// Subscribes to new heads. Each head carries this node's chain ID; errors are
    /// prefixed with the primary transport's URI. The subscription is stopped when the
    /// node leaves `Alive`.
    pub async fn subscribe_new_heads(&self) -> Result<Subscription<Head>, NodeError> {
        let (route, token) = self.alive_route()?;
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(NodeError::Cancelled),
            sub = self.open_heads(&route) => sub,
        };
        let result = result.and_then(|sub| {
            self.register_subscription(sub.handle().clone(), &token, false)?;
            Ok(sub)
        });
        self.metrics.call(&self.name, "eth_subscribe", result.is_ok(), started.elapsed());
        result
    }
}

fn decode<T>(value: &Value, f: fn(&Value) -> Result<T, QuantityError>) -> Result<T, NodeError> {
    f(value).map_err(|e| NodeError::InvalidResponse(e.to_string()))
}

fn as_string(value: &Value) -> Result<String, NodeError> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| NodeError::InvalidResponse(format!("expected string, got {value}")))
}

fn non_null(value: Value) -> Option<Value> {
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}
