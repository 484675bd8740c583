//! WebSocket JSON-RPC transport.
//!
//! One connection carries both request/response traffic and `eth_subscription`
//! notifications. A reader task routes every incoming frame: responses by `id` to the
//! waiting caller, notifications by subscription id to the owning [`Subscription`].
//! When the socket drops, every pending call fails and every subscription receives an
//! error, so consumers never hang on a dead connection.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{future::join_all, stream::SplitSink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    errors::NodeError,
    subscription::{Subscription, SubscriptionHandle, ITEM_CHANNEL_CAPACITY},
    transport::{RpcTransport, StreamingTransport},
};
use crate::types::{BatchElem, JsonRpcRequest, JsonRpcResponse};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = Result<Value, NodeError>;

struct SubscriptionSlot {
    items: mpsc::Sender<Value>,
    errors: mpsc::Sender<NodeError>,
}

/// A caller waiting for a reply. `slot` is set for `eth_subscribe` requests and is
/// installed by the reader as soon as the reply carries a subscription id, so
/// notifications later in the same read burst are not lost.
struct Waiter {
    reply: oneshot::Sender<Reply>,
    slot: Option<SubscriptionSlot>,
}

/// Removes its request ids from the pending map when the caller goes away, whether the
/// call completed, timed out, or its future was dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, Waiter>,
    ids: Vec<u64>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.pending.remove(id);
        }
    }
}

struct Shared {
    uri: String,
    next_id: AtomicU64,
    pending: DashMap<u64, Waiter>,
    subscriptions: DashMap<String, SubscriptionSlot>,
    closed: CancellationToken,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => items.into_iter().for_each(|v| self.dispatch_value(v)),
            Ok(value) => self.dispatch_value(value),
            Err(e) => tracing::warn!(uri = %self.uri, error = %e, "failed to parse websocket frame"),
        }
    }

    fn dispatch_value(&self, value: Value) {
        if value.get("method").and_then(Value::as_str) == Some("eth_subscription") {
            self.dispatch_notification(&value);
            return;
        }
        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            tracing::debug!(uri = %self.uri, "ignoring websocket frame without id");
            return;
        };
        let reply = serde_json::from_value::<JsonRpcResponse>(value)
            .map_err(|e| NodeError::InvalidResponse(e.to_string()))
            .and_then(JsonRpcResponse::into_result);
        let Some((_, waiter)) = self.pending.remove(&id) else { return };
        let installed = match (waiter.slot, &reply) {
            (Some(slot), Ok(Value::String(sub_id))) => {
                self.subscriptions.insert(sub_id.clone(), slot);
                Some(sub_id.clone())
            }
            _ => None,
        };
        if waiter.reply.send(reply).is_err() {
            if let Some(sub_id) = installed {
                self.subscriptions.remove(&sub_id);
            }
        }
    }

    fn dispatch_notification(&self, value: &Value) {
        let Some(params) = value.get("params") else { return };
        let Some(sub_id) = params.get("subscription").and_then(Value::as_str) else { return };
        let Some(slot) = self.subscriptions.get(sub_id) else {
            tracing::trace!(uri = %self.uri, subscription = sub_id, "notification for unknown subscription");
            return;
        };
        let result = params.get("result").cloned().unwrap_or(Value::Null);
        match slot.items.try_send(result) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(uri = %self.uri, subscription = sub_id, "subscription consumer lagging; dropping notification");
            }
            Err(TrySendError::Closed(_)) => {
                drop(slot);
                self.subscriptions.remove(sub_id);
            }
        }
    }

    /// Fails every pending call and subscription. Safe to call more than once.
    fn fail_all(&self, reason: &str) {
        self.closed.cancel();
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.reply.send(Err(NodeError::ConnectionFailed(reason.to_string())));
            }
        }
        let subs: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for sub_id in subs {
            if let Some((_, slot)) = self.subscriptions.remove(&sub_id) {
                let _ = slot.errors.try_send(NodeError::ConnectionFailed(reason.to_string()));
            }
        }
    }
}

/// JSON-RPC over a single WebSocket connection.
pub struct WsTransport {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    request_timeout: Duration,
}

/// Rejects URLs that are not `ws://` or `wss://`.
///
/// # Errors
/// Returns `NodeError::ConnectionFailed` describing the offending scheme.
pub fn validate_ws_url(url: &Url) -> Result<(), NodeError> {
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(NodeError::ConnectionFailed(format!(
            "invalid websocket URL scheme '{other}' (must be ws:// or wss://)"
        ))),
    }
}

impl WsTransport {
    /// Opens the connection and starts the reader and writer tasks.
    ///
    /// # Errors
    /// Returns `NodeError::Timeout` if the handshake exceeds `request_timeout` and
    /// `NodeError::ConnectionFailed` for any other handshake failure.
    pub async fn connect(url: &Url, request_timeout: Duration) -> Result<Self, NodeError> {
        validate_ws_url(url)?;
        let uri = url.to_string();

        let (stream, response) =
            tokio::time::timeout(request_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| NodeError::Timeout)?
                .map_err(|e| describe_handshake_error(&uri, &e))?;
        tracing::debug!(uri = %uri, status = response.status().as_u16(), "websocket connected");

        let shared = Arc::new(Shared {
            uri,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            subscriptions: DashMap::new(),
            closed: CancellationToken::new(),
        });
        let (write, read) = stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(write, outbound_rx, shared.closed.clone()));
        tokio::spawn(read_loop(read, Arc::clone(&shared)));

        Ok(Self { shared, outbound, request_timeout })
    }

    fn send_frame(&self, text: String) -> Result<(), NodeError> {
        if self.shared.closed.is_cancelled() {
            return Err(NodeError::Closed);
        }
        self.outbound.send(Message::Text(text.into())).map_err(|_| NodeError::Closed)
    }

    fn register(&self, id: u64, slot: Option<SubscriptionSlot>) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, Waiter { reply: tx, slot });
        rx
    }

    async fn await_reply(&self, rx: oneshot::Receiver<Reply>) -> Reply {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(NodeError::ConnectionFailed("websocket connection closed".into())),
            Err(_) => Err(NodeError::Timeout),
        }
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        slot: Option<SubscriptionSlot>,
    ) -> Result<Value, NodeError> {
        let id = self.shared.next_id();
        let rx = self.register(id, slot);
        let _pending = PendingGuard { pending: &self.shared.pending, ids: vec![id] };
        let text = serde_json::to_string(&JsonRpcRequest::new(method, params, id))
            .map_err(|e| NodeError::InvalidResponse(e.to_string()))?;
        self.send_frame(text)?;
        self.await_reply(rx).await
    }
}

fn describe_handshake_error(uri: &str, e: &tokio_tungstenite::tungstenite::Error) -> NodeError {
    let text = e.to_string();
    tracing::debug!(uri, error = %e, "websocket handshake failed");
    if text.contains("HTTP error: 200 OK") {
        NodeError::ConnectionFailed("server does not speak the websocket protocol".into())
    } else if text.contains("HTTP error: 403") {
        NodeError::ConnectionFailed("websocket access forbidden (403 Forbidden)".into())
    } else {
        NodeError::ConnectionFailed(format!("websocket connection failed: {e}"))
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(error = %e, "websocket write failed");
                    closed.cancel();
                    break;
                }
            }
        }
    }
}

async fn read_loop(mut stream: futures_util::stream::SplitStream<WsStream>, shared: Arc<Shared>) {
    let reason = loop {
        let msg = tokio::select! {
            biased;
            () = shared.closed.cancelled() => break "websocket transport closed",
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => shared.dispatch(text.as_str()),
            Some(Ok(Message::Close(_))) | None => break "websocket closed by remote",
            Some(Err(e)) => {
                tracing::warn!(uri = %shared.uri, error = %e, "websocket read error");
                break "websocket read error";
            }
            Some(Ok(_)) => {}
        }
    };
    shared.fail_all(reason);
}

#[async_trait]
impl RpcTransport for WsTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        self.request(method, params, None).await
    }

    async fn batch_call(&self, batch: &mut [BatchElem]) -> Result<(), NodeError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut ids = Vec::with_capacity(batch.len());
        let mut receivers = Vec::with_capacity(batch.len());
        let mut requests = Vec::with_capacity(batch.len());
        for elem in batch.iter() {
            let id = self.shared.next_id();
            receivers.push(self.register(id, None));
            requests.push(JsonRpcRequest::new(elem.method.clone(), elem.params.clone(), id));
            ids.push(id);
        }
        let _pending = PendingGuard { pending: &self.shared.pending, ids };
        let text = serde_json::to_string(&requests)
            .map_err(|e| NodeError::InvalidResponse(e.to_string()))?;
        self.send_frame(text)?;

        let replies = join_all(receivers.into_iter().map(|rx| self.await_reply(rx))).await;
        for (elem, reply) in batch.iter_mut().zip(replies) {
            match reply {
                Ok(value) => elem.result = Some(value),
                Err(e) => elem.error = Some(e),
            }
        }
        Ok(())
    }

    fn uri(&self) -> &str {
        &self.shared.uri
    }

    fn close(&self) {
        self.shared.fail_all("websocket transport closed");
    }
}

#[async_trait]
impl StreamingTransport for WsTransport {
    async fn subscribe(&self, params: Value) -> Result<Subscription<Value>, NodeError> {
        let (item_tx, item_rx) = mpsc::channel(ITEM_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(1);
        let slot = SubscriptionSlot { items: item_tx, errors: err_tx };
        let reply = self.request("eth_subscribe", params, Some(slot)).await?;
        let sub_id = reply
            .as_str()
            .ok_or_else(|| NodeError::InvalidResponse(format!("subscription id {reply}")))?
            .to_string();

        let (handle, guard) = SubscriptionHandle::new();
        let stop = handle.stop_token();
        let shared = Arc::clone(&self.shared);
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                () = stop.cancelled() => {}
                () = shared.closed.cancelled() => {}
            }
            if shared.subscriptions.remove(&sub_id).is_some() && !shared.closed.is_cancelled() {
                let request = json!({
                    "jsonrpc": "2.0",
                    "id": shared.next_id(),
                    "method": "eth_unsubscribe",
                    "params": [sub_id],
                });
                let _ = outbound.send(Message::Text(request.to_string().into()));
            }
        });

        Ok(Subscription::new(item_rx, err_rx, handle))
    }

    fn as_unary(self: Arc<Self>) -> Arc<dyn RpcTransport> {
        self
    }
}
