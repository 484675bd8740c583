//! Scripted in-process endpoint.
//!
//! A [`MockEndpoint`] plays the remote node: it answers unary calls from a response
//! table, serves `newHeads` subscriptions whose items and errors the test drives, and can
//! be made unreachable. [`MockEndpoint::connector`] hands out a [`Connector`] that dials
//! it, so nodes under test run their real lifecycle against it.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use lattice_core::{
    types::{BatchElem, ChainId},
    upstream::{
        Connection, Connector, NodeError, RpcTransport, StreamingTransport, Subscription,
        SubscriptionHandle,
    },
};

/// Channel capacity of a mock head feed.
const FEED_CAPACITY: usize = 64;

struct HeadFeed {
    items: mpsc::Sender<Value>,
    errors: mpsc::Sender<NodeError>,
    handle: SubscriptionHandle,
}

/// A fake JSON-RPC node shared by every transport dialed to it.
pub struct MockEndpoint {
    name: String,
    chain_id: AtomicU64,
    reachable: AtomicBool,
    responses: Mutex<HashMap<String, Result<Value, NodeError>>>,
    calls: DashMap<String, usize>,
    dials: AtomicUsize,
    feeds: Mutex<Vec<HeadFeed>>,
}

impl MockEndpoint {
    #[must_use]
    pub fn new(name: &str, chain_id: ChainId) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            chain_id: AtomicU64::new(chain_id),
            reachable: AtomicBool::new(true),
            responses: Mutex::new(HashMap::new()),
            calls: DashMap::new(),
            dials: AtomicUsize::new(0),
            feeds: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connector that dials this endpoint.
    #[must_use]
    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector { endpoint: Arc::clone(self) })
    }

    /// Chain ID reported by `eth_chainId`.
    pub fn set_chain_id(&self, chain_id: ChainId) {
        self.chain_id.store(chain_id, Ordering::SeqCst);
    }

    /// An unreachable endpoint refuses dials, calls and subscriptions.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Overrides the reply to `method`.
    pub fn respond(&self, method: &str, reply: Result<Value, NodeError>) {
        self.responses.lock().insert(method.to_string(), reply);
    }

    /// Makes `method` fail with a JSON-RPC error carrying `message`.
    pub fn respond_error(&self, method: &str, message: &str) {
        self.respond(method, Err(NodeError::Rpc { code: -32000, message: message.to_string() }));
    }

    #[must_use]
    pub fn calls(&self, method: &str) -> usize {
        self.calls.get(method).map_or(0, |c| *c)
    }

    #[must_use]
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Subscriptions whose consumer has not stopped them yet.
    #[must_use]
    pub fn open_subscriptions(&self) -> usize {
        let mut feeds = self.feeds.lock();
        feeds.retain(|f| !f.handle.is_stopped());
        feeds.len()
    }

    /// Pushes a head to every open subscription.
    pub fn push_head(&self, number: u64) {
        self.push(&head_json(number, None));
    }

    pub fn push_head_with_difficulty(&self, number: u64, total_difficulty: u128) {
        self.push(&head_json(number, Some(total_difficulty)));
    }

    fn push(&self, head: &Value) {
        let mut feeds = self.feeds.lock();
        feeds.retain(|f| !f.handle.is_stopped());
        for feed in feeds.iter() {
            let _ = feed.items.try_send(head.clone());
        }
    }

    /// Terminates every open subscription with `message`.
    pub fn fail_subscriptions(&self, message: &str) {
        for feed in self.feeds.lock().drain(..) {
            let _ = feed.errors.try_send(NodeError::Subscription(message.to_string()));
        }
    }

    /// Ends every open subscription without an error.
    pub fn close_subscriptions(&self) {
        for feed in self.feeds.lock().drain(..) {
            feed.handle.request_stop();
        }
    }

    fn record_call(&self, method: &str) {
        *self.calls.entry(method.to_string()).or_insert(0) += 1;
    }

    fn reply(&self, method: &str, params: &Value) -> Result<Value, NodeError> {
        self.record_call(method);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(NodeError::ConnectionFailed(format!("{} is unreachable", self.name)));
        }
        if let Some(reply) = self.responses.lock().get(method) {
            return reply.clone();
        }
        match method {
            "eth_chainId" => Ok(json!(format!("0x{:x}", self.chain_id.load(Ordering::SeqCst)))),
            "web3_clientVersion" => Ok(json!(format!("MockClient/{}", self.name))),
            "eth_blockNumber" => Ok(json!("0x10")),
            "eth_sendRawTransaction" => Ok(json!(format!("0x{:064x}", 1))),
            "echo" => Ok(params.clone()),
            _ => Err(NodeError::Rpc { code: -32601, message: format!("method {method} not found") }),
        }
    }

    fn open_feed(&self) -> Result<Subscription<Value>, NodeError> {
        self.record_call("eth_subscribe");
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(NodeError::ConnectionFailed(format!("{} is unreachable", self.name)));
        }
        let (item_tx, item_rx) = mpsc::channel(FEED_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(1);
        let (handle, guard) = SubscriptionHandle::new();
        let stop = handle.stop_token();
        tokio::spawn(async move {
            let _guard = guard;
            stop.cancelled().await;
        });
        self.feeds.lock().push(HeadFeed {
            items: item_tx,
            errors: err_tx,
            handle: handle.clone(),
        });
        Ok(Subscription::new(item_rx, err_rx, handle))
    }
}

/// `newHeads` payload for block `number`.
#[must_use]
pub fn head_json(number: u64, total_difficulty: Option<u128>) -> Value {
    let mut head = json!({
        "number": format!("0x{number:x}"),
        "hash": format!("0x{number:064x}"),
        "parentHash": format!("0x{:064x}", number.saturating_sub(1)),
    });
    if let Some(td) = total_difficulty {
        head["totalDifficulty"] = json!(format!("0x{td:x}"));
    }
    head
}

/// One dialed connection to a [`MockEndpoint`].
pub struct MockTransport {
    endpoint: Arc<MockEndpoint>,
    uri: String,
    closed: AtomicBool,
}

impl MockTransport {
    #[must_use]
    pub fn new(endpoint: Arc<MockEndpoint>) -> Self {
        let uri = format!("mock://{}", endpoint.name());
        Self { endpoint, uri, closed: AtomicBool::new(false) }
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NodeError::Closed);
        }
        // Yield so callers observe the call as asynchronous.
        tokio::task::yield_now().await;
        self.endpoint.reply(method, &params)
    }

    async fn batch_call(&self, batch: &mut [BatchElem]) -> Result<(), NodeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NodeError::Closed);
        }
        for elem in batch.iter_mut() {
            match self.endpoint.reply(&elem.method, &elem.params) {
                Ok(value) => elem.result = Some(value),
                Err(e) => elem.error = Some(e),
            }
        }
        Ok(())
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamingTransport for MockTransport {
    async fn subscribe(&self, _params: Value) -> Result<Subscription<Value>, NodeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NodeError::Closed);
        }
        self.endpoint.open_feed()
    }

    fn as_unary(self: Arc<Self>) -> Arc<dyn RpcTransport> {
        self
    }
}

/// Dials a [`MockEndpoint`]. Every connection carries a primary and a secondary
/// transport to the same endpoint.
pub struct MockConnector {
    endpoint: Arc<MockEndpoint>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Connection, NodeError> {
        self.endpoint.dials.fetch_add(1, Ordering::SeqCst);
        if !self.endpoint.reachable.load(Ordering::SeqCst) {
            return Err(NodeError::ConnectionFailed(format!(
                "dial {}: connection refused",
                self.endpoint.name()
            )));
        }
        let primary = Arc::new(MockTransport::new(Arc::clone(&self.endpoint)));
        let secondary = Arc::new(MockTransport::new(Arc::clone(&self.endpoint)));
        Ok(Connection {
            primary: Some(primary as Arc<dyn StreamingTransport>),
            secondary: Some(secondary as Arc<dyn RpcTransport>),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_answers_defaults_and_overrides() {
        let endpoint = MockEndpoint::new("a", 5);
        let transport = MockTransport::new(Arc::clone(&endpoint));

        assert_eq!(transport.call("eth_chainId", json!([])).await.unwrap(), json!("0x5"));
        endpoint.respond_error("eth_chainId", "boom");
        assert!(transport.call("eth_chainId", json!([])).await.is_err());
        assert_eq!(endpoint.calls("eth_chainId"), 2);

        transport.close();
        assert_eq!(transport.call("eth_chainId", json!([])).await, Err(NodeError::Closed));
    }

    #[tokio::test]
    async fn test_feed_delivers_heads_until_stopped() {
        let endpoint = MockEndpoint::new("a", 1);
        let transport = MockTransport::new(Arc::clone(&endpoint));
        let sub = transport.subscribe(json!(["newHeads"])).await.unwrap();
        assert_eq!(endpoint.open_subscriptions(), 1);

        endpoint.push_head(3);
        let (mut items, _errors, handle) = sub.into_parts();
        assert_eq!(items.recv().await.unwrap()["number"], json!("0x3"));

        handle.unsubscribe().await;
        assert_eq!(endpoint.open_subscriptions(), 0);
    }
}
