//! The node pool: startup dialing, background sweep, lease-based best node switching,
//! read dispatch and transaction fan-out.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use arc_swap::ArcSwapOption;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    classifier::{aggregate_tx_results, classify_send_error, SendError, SendTxReturnCode, TxOutcome},
    errors::{NodeError, PoolError},
    health::{self, PoolHealth},
    node::{LiveNodesFn, Node},
    node_state::NodeState,
    selector::{new_node_selector, NodeSelector},
    send_only::SendOnlyNode,
    subscription::Subscription,
};
use crate::{
    config::{PoolConfig, SelectionMode},
    metrics::PoolMetrics,
    types::{BatchElem, ChainId, ChainInfo, Head},
    utils::BlockRef,
};

/// Count of alive nodes and the field-wise best position among them.
fn latest_chain_info_of(nodes: &[Arc<Node>]) -> (usize, ChainInfo) {
    nodes.iter().fold((0, ChainInfo::default()), |(live, best), node| {
        let (state, info) = node.state_and_latest();
        if state == NodeState::Alive {
            (live + 1, best.max(info))
        } else {
            (live, best)
        }
    })
}

fn live_nodes_fn(nodes: Weak<Vec<Arc<Node>>>) -> LiveNodesFn {
    Arc::new(move || {
        nodes.upgrade().map_or((0, ChainInfo::default()), |nodes| latest_chain_info_of(&nodes))
    })
}

fn log_send_result(node: &str, result: &Result<(), NodeError>) {
    match result {
        Ok(()) => debug!(node, "Node sent transaction"),
        Err(e) => {
            let send_err = SendError::from(e);
            if send_err.is_nonce_too_low_error() || send_err.is_transaction_already_in_mempool() {
                debug!(node, error = %e, "RPC returned error");
            } else {
                warn!(node, error = %e, "RPC returned error");
            }
        }
    }
}

/// A pool of redundant endpoints for one chain.
pub struct Pool {
    config: PoolConfig,
    nodes: Arc<Vec<Arc<Node>>>,
    send_only: Vec<Arc<SendOnlyNode>>,
    selector: Arc<dyn NodeSelector<Node>>,
    active: Arc<ArcSwapOption<Node>>,
    metrics: PoolMetrics,
    started: AtomicBool,
    closed: AtomicBool,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    fanout: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("chain_id", &self.config.chain_id)
            .field("selector", &self.selector.name())
            .field("nodes", &self.nodes.len())
            .field("send_only", &self.send_only.len())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Creates a pool over fixed node lists. Nothing is dialed until [`Pool::dial`].
    #[must_use]
    pub fn new(
        config: PoolConfig,
        nodes: Vec<Arc<Node>>,
        send_only: Vec<Arc<SendOnlyNode>>,
        metrics: PoolMetrics,
    ) -> Self {
        let nodes = Arc::new(nodes);
        let selector = new_node_selector(config.selection_mode, Arc::clone(&nodes));
        Self {
            config,
            nodes,
            send_only,
            selector,
            active: Arc::new(ArcSwapOption::empty()),
            metrics,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            fanout: Mutex::new(JoinSet::new()),
        }
    }

    #[must_use]
    pub fn configured_chain_id(&self) -> ChainId {
        self.config.chain_id
    }

    #[must_use]
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    #[must_use]
    pub fn send_only_nodes(&self) -> &[Arc<SendOnlyNode>] {
        &self.send_only
    }

    #[must_use]
    pub fn selector_name(&self) -> &'static str {
        self.selector.name()
    }

    fn lease_enabled(&self) -> bool {
        self.config.selection_mode != SelectionMode::RoundRobin
            && !self.config.lease_duration().is_zero()
    }

    /// Starts every node and the background tasks. A second call is a no-op.
    ///
    /// Primary nodes that fail to dial are left to recover on their own. A send-only node
    /// that fails to start aborts startup and closes everything already started.
    ///
    /// # Errors
    /// Fails when there are no primary nodes, a node is configured for another chain, or
    /// a send-only node cannot be started.
    pub async fn dial(&self) -> Result<(), PoolError> {
        let chain_id = self.config.chain_id;
        if self.nodes.is_empty() {
            return Err(PoolError::NoNodes { chain_id });
        }
        for node in self.nodes.iter() {
            if node.configured_chain_id() != chain_id {
                return Err(PoolError::ChainIdMismatch {
                    name: node.name().to_string(),
                    node_chain_id: node.configured_chain_id(),
                    pool_chain_id: chain_id,
                });
            }
        }
        for node in &self.send_only {
            if node.configured_chain_id() != chain_id {
                return Err(PoolError::SendOnlyChainIdMismatch {
                    name: node.name().to_string(),
                    node_chain_id: node.configured_chain_id(),
                    pool_chain_id: chain_id,
                });
            }
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Stopped);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let live_nodes = live_nodes_fn(Arc::downgrade(&self.nodes));
        for node in self.nodes.iter() {
            node.set_live_nodes_fn(Arc::clone(&live_nodes));
        }

        let starts = join_all(self.nodes.iter().map(|node| node.start())).await;
        for (node, result) in self.nodes.iter().zip(starts) {
            if let Err(e) = result {
                warn!(node = %node.name(), error = %e, "failed to start rpc node");
            }
        }

        for node in &self.send_only {
            if let Err(e) = node.start().await {
                error!(node = %node.name(), error = %e, "failed to start sendonly rpc node");
                self.close().await;
                return Err(PoolError::SendOnlyStart { name: node.name().to_string(), source: e });
            }
        }

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_sweep());
        if self.lease_enabled() {
            tasks.push(self.spawn_lease());
        } else {
            info!(mode = %self.config.selection_mode, "Best node switching is disabled");
        }
        info!(
            chain_id,
            nodes = self.nodes.len(),
            send_only = self.send_only.len(),
            selector = self.selector.name(),
            "rpc pool dialed"
        );
        Ok(())
    }

    fn spawn_sweep(&self) -> JoinHandle<()> {
        let nodes = Arc::clone(&self.nodes);
        let metrics = self.metrics.clone();
        let stop = self.stop.clone();
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => return,
                    _ = interval.tick() => {}
                }
                tokio::select! {
                    biased;
                    () = stop.cancelled() => return,
                    () = health::sweep(&nodes) => {}
                }
                health::report(&nodes, &metrics);
            }
        })
    }

    fn spawn_lease(&self) -> JoinHandle<()> {
        let selector = Arc::clone(&self.selector);
        let active = Arc::clone(&self.active);
        let stop = self.stop.clone();
        let period = self.config.lease_duration();
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let Some(best) = selector.select() else { continue };
                let current = active.load_full();
                if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &best)) {
                    continue;
                }
                info!(
                    "Switching to best node from {:?} to {:?}",
                    current.as_ref().map_or("", |c| c.name()),
                    best.name()
                );
                if let Some(current) = current {
                    current.unsubscribe_all_except_alive_loop();
                }
                active.store(Some(best));
            }
        })
    }

    /// Picks the node that serves the next read.
    ///
    /// # Errors
    /// Returns `PoolError::NoLiveNodes` when no primary node is alive.
    pub fn select_node(&self) -> Result<Arc<Node>, PoolError> {
        let lease = self.lease_enabled();
        if lease {
            if let Some(active) = self.active.load_full() {
                if active.state() == NodeState::Alive {
                    return Ok(active);
                }
            }
        }
        match self.selector.select() {
            Some(node) => {
                if lease {
                    self.active.store(Some(Arc::clone(&node)));
                }
                Ok(node)
            }
            None => {
                error!(chain_id = self.config.chain_id, "No live RPC nodes available");
                Err(PoolError::NoLiveNodes { chain_id: self.config.chain_id })
            }
        }
    }

    /// `(live node count, best position among live nodes)`.
    #[must_use]
    pub fn latest_chain_info(&self) -> (usize, ChainInfo) {
        latest_chain_info_of(&self.nodes)
    }

    /// # Errors
    /// Returns `PoolError::NoPrimaryNodesAvailable` when no primary node is alive.
    pub fn healthy(&self) -> Result<(), PoolError> {
        PoolHealth::of(&self.nodes).check()
    }

    /// Node name to state string, over primary and send-only nodes.
    #[must_use]
    pub fn node_states(&self) -> HashMap<String, String> {
        let primaries = self.nodes.iter().map(|n| (n.name().to_string(), n.state()));
        let send_only = self.send_only.iter().map(|n| (n.name().to_string(), n.state()));
        primaries.chain(send_only).map(|(name, state)| (name, state.as_str().to_string())).collect()
    }

    fn secondaries_except(&self, main: &Arc<Node>) -> (Vec<Arc<Node>>, Vec<Arc<SendOnlyNode>>) {
        let nodes = self
            .nodes
            .iter()
            .filter(|n| !Arc::ptr_eq(n, main) && n.state() == NodeState::Alive)
            .cloned()
            .collect();
        let send_only =
            self.send_only.iter().filter(|n| n.state() == NodeState::Alive).cloned().collect();
        (nodes, send_only)
    }

    /// Sends a raw transaction through the selected node and, in the background, through
    /// every other alive node and alive send-only node. Returns the selected node's
    /// result; "already known" and "already mined" replies count as success.
    ///
    /// # Errors
    /// Fails with `PoolError::Stopped` after close, `PoolError::NoLiveNodes` without a
    /// live node, or the selected node's error.
    pub async fn send_transaction(&self, raw_tx: &str) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Stopped);
        }
        let main = self.select_node()?;
        let (nodes, send_only) = self.secondaries_except(&main);
        let raw: Arc<str> = Arc::from(raw_tx);
        {
            let mut fanout = self.fanout.lock();
            while fanout.try_join_next().is_some() {}
            for node in nodes {
                let (raw, stop) = (Arc::clone(&raw), self.stop.clone());
                fanout.spawn(async move {
                    tokio::select! {
                        biased;
                        () = stop.cancelled() => {}
                        res = node.send_transaction(&raw) => log_send_result(node.name(), &res),
                    }
                });
            }
            for node in send_only {
                let (raw, stop) = (Arc::clone(&raw), self.stop.clone());
                fanout.spawn(async move {
                    tokio::select! {
                        biased;
                        () = stop.cancelled() => {}
                        res = node.send_transaction(&raw) => log_send_result(node.name(), &res),
                    }
                });
            }
        }

        let result = tokio::select! {
            biased;
            () = self.stop.cancelled() => return Err(PoolError::Stopped),
            res = main.send_transaction(raw_tx) => res,
        };
        match result {
            Ok(()) => {
                debug!(node = %main.name(), "Node sent transaction");
                Ok(())
            }
            Err(e) => {
                let send_err = SendError::from(&e);
                if send_err.is_transaction_already_in_mempool()
                    || send_err.is_transaction_already_mined()
                {
                    debug!(node = %main.name(), error = %e, "transaction already known to main node");
                    return Ok(());
                }
                warn!(node = %main.name(), error = %e, "RPC returned error");
                Err(PoolError::Node(e))
            }
        }
    }

    /// Sends a raw transaction to every alive endpoint and aggregates the replies.
    ///
    /// Collection stops at the first success, or `send_tx_soft_timeout` after the first
    /// reply. Returns the success code on success.
    ///
    /// # Errors
    /// Returns `PoolError::Send` with the aggregated error, `PoolError::NoLiveNodes`
    /// without a live primary node, or `PoolError::Stopped` after close.
    pub async fn broadcast_transaction(&self, raw_tx: &str) -> Result<SendTxReturnCode, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Stopped);
        }
        let primaries: Vec<_> =
            self.nodes.iter().filter(|n| n.state() == NodeState::Alive).cloned().collect();
        if primaries.is_empty() {
            error!(chain_id = self.config.chain_id, "No live RPC nodes available");
            return Err(PoolError::NoLiveNodes { chain_id: self.config.chain_id });
        }
        let send_only: Vec<_> =
            self.send_only.iter().filter(|n| n.state() == NodeState::Alive).cloned().collect();

        let raw: Arc<str> = Arc::from(raw_tx);
        let (tx, mut rx) = mpsc::channel::<TxOutcome>(primaries.len() + send_only.len());
        {
            let mut fanout = self.fanout.lock();
            while fanout.try_join_next().is_some() {}
            for node in primaries {
                let (raw, stop, tx) = (Arc::clone(&raw), self.stop.clone(), tx.clone());
                fanout.spawn(async move {
                    tokio::select! {
                        biased;
                        () = stop.cancelled() => {}
                        res = node.send_transaction(&raw) => {
                            log_send_result(node.name(), &res);
                            let _ = tx.send(res.map_err(SendError::from)).await;
                        }
                    }
                });
            }
            for node in send_only {
                let (raw, stop, tx) = (Arc::clone(&raw), self.stop.clone(), tx.clone());
                fanout.spawn(async move {
                    tokio::select! {
                        biased;
                        () = stop.cancelled() => {}
                        res = node.send_transaction(&raw) => {
                            log_send_result(node.name(), &res);
                            let _ = tx.send(res.map_err(SendError::from)).await;
                        }
                    }
                });
            }
        }
        drop(tx);

        let mut results: BTreeMap<SendTxReturnCode, Vec<TxOutcome>> = BTreeMap::new();
        let mut record = |outcome: TxOutcome| {
            let code = classify_send_error(outcome.as_ref().map(|_| ()));
            results.entry(code).or_default().push(outcome);
            code
        };

        let first = tokio::select! {
            biased;
            () = self.stop.cancelled() => return Err(PoolError::Stopped),
            first = rx.recv() => first,
        };
        if let Some(first) = first {
            if !record(first).is_success() {
                let soft_timeout = tokio::time::sleep(self.config.send_tx_soft_timeout());
                tokio::pin!(soft_timeout);
                loop {
                    tokio::select! {
                        biased;
                        () = self.stop.cancelled() => return Err(PoolError::Stopped),
                        () = &mut soft_timeout => break,
                        next = rx.recv() => match next {
                            Some(outcome) => if record(outcome).is_success() { break },
                            None => break,
                        },
                    }
                }
            }
        }

        let aggregated = aggregate_tx_results(&results);
        if let Some(violation) = &aggregated.violation {
            error!(violation = %violation, "observed invariant violation on SendTransaction");
        }
        match aggregated.outcome {
            Ok(()) => Ok(SendTxReturnCode::Successful),
            Err(error) => {
                let code = classify_send_error(Err(&error));
                if code.is_success() {
                    Ok(code)
                } else {
                    Err(PoolError::Send { code, error })
                }
            }
        }
    }

    /// Runs `batch` on the selected node and copies of it on every other alive endpoint.
    ///
    /// # Errors
    /// Returns the selected node's error; secondary failures are only logged.
    pub async fn batch_call_context_all(&self, batch: &mut [BatchElem]) -> Result<(), PoolError> {
        let main = self.select_node()?;
        let (nodes, send_only) = self.secondaries_except(&main);

        let mut secondaries: Vec<BoxFuture<'static, ()>> = Vec::new();
        for node in nodes {
            let mut copy = batch.to_vec();
            secondaries.push(
                async move {
                    if let Err(e) = node.batch_call_context(&mut copy).await {
                        warn!(node = %node.name(), error = %e, "Secondary node BatchCallContext failed");
                    }
                }
                .boxed(),
            );
        }
        for node in send_only {
            let mut copy = batch.to_vec();
            secondaries.push(
                async move {
                    if let Err(e) = node.batch_call_context(&mut copy).await {
                        warn!(node = %node.name(), error = %e, "Secondary node BatchCallContext failed");
                    }
                }
                .boxed(),
            );
        }

        let (main_result, _) = tokio::join!(main.batch_call_context(batch), join_all(secondaries));
        Ok(main_result?)
    }

    /// Stops background tasks, drains fan-out work and closes every node. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        let mut fanout = std::mem::take(&mut *self.fanout.lock());
        while fanout.join_next().await.is_some() {}

        join_all(self.nodes.iter().map(|n| n.close())).await;
        join_all(self.send_only.iter().map(|n| n.close())).await;
        self.active.store(None);
        info!(chain_id = self.config.chain_id, "rpc pool closed");
    }

    // ---- reads, dispatched to the selected node ----

    pub async fn call_context(&self, method: &str, params: Value) -> Result<Value, PoolError> {
        Ok(self.select_node()?.call_context(method, params).await?)
    }

    pub async fn batch_call_context(&self, batch: &mut [BatchElem]) -> Result<(), PoolError> {
        Ok(self.select_node()?.batch_call_context(batch).await?)
    }

    pub async fn chain_id(&self) -> Result<ChainId, PoolError> {
        Ok(self.select_node()?.chain_id().await?)
    }

    pub async fn block_number(&self) -> Result<u64, PoolError> {
        Ok(self.select_node()?.block_number().await?)
    }

    pub async fn balance_at(&self, address: &str, block: BlockRef) -> Result<u128, PoolError> {
        Ok(self.select_node()?.balance_at(address, block).await?)
    }

    pub async fn code_at(&self, address: &str, block: BlockRef) -> Result<String, PoolError> {
        Ok(self.select_node()?.code_at(address, block).await?)
    }

    pub async fn nonce_at(&self, address: &str, block: BlockRef) -> Result<u64, PoolError> {
        Ok(self.select_node()?.nonce_at(address, block).await?)
    }

    pub async fn pending_nonce_at(&self, address: &str) -> Result<u64, PoolError> {
        Ok(self.select_node()?.pending_nonce_at(address).await?)
    }

    pub async fn filter_logs(&self, filter: Value) -> Result<Vec<Value>, PoolError> {
        Ok(self.select_node()?.filter_logs(filter).await?)
    }

    pub async fn transaction_receipt(&self, hash: &str) -> Result<Option<Value>, PoolError> {
        Ok(self.select_node()?.transaction_receipt(hash).await?)
    }

    pub async fn transaction_by_hash(&self, hash: &str) -> Result<Option<Value>, PoolError> {
        Ok(self.select_node()?.transaction_by_hash(hash).await?)
    }

    pub async fn header_by_number(&self, block: BlockRef) -> Result<Option<Head>, PoolError> {
        Ok(self.select_node()?.header_by_number(block).await?)
    }

    pub async fn block_by_number(
        &self,
        block: BlockRef,
        full_transactions: bool,
    ) -> Result<Option<Value>, PoolError> {
        Ok(self.select_node()?.block_by_number(block, full_transactions).await?)
    }

    pub async fn block_by_hash(
        &self,
        hash: &str,
        full_transactions: bool,
    ) -> Result<Option<Value>, PoolError> {
        Ok(self.select_node()?.block_by_hash(hash, full_transactions).await?)
    }

    pub async fn estimate_gas(&self, call: Value) -> Result<u64, PoolError> {
        Ok(self.select_node()?.estimate_gas(call).await?)
    }

    pub async fn suggest_gas_price(&self) -> Result<u128, PoolError> {
        Ok(self.select_node()?.suggest_gas_price().await?)
    }

    pub async fn suggest_gas_tip_cap(&self) -> Result<u128, PoolError> {
        Ok(self.select_node()?.suggest_gas_tip_cap().await?)
    }

    pub async fn call_contract(&self, call: Value, block: BlockRef) -> Result<String, PoolError> {
        Ok(self.select_node()?.call_contract(call, block).await?)
    }

    pub async fn client_version(&self) -> Result<String, PoolError> {
        Ok(self.select_node()?.client_version().await?)
    }

    pub async fn subscribe_new_heads(&self) -> Result<Subscription<Head>, PoolError> {
        Ok(self.select_node()?.subscribe_new_heads().await?)
    }
}
