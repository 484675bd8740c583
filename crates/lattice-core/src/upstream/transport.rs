//! Transport seams between a node and its endpoint.
//!
//! A node talks to its endpoint through a primary [`StreamingTransport`] (calls plus push
//! subscriptions) and, optionally, a secondary unary [`RpcTransport`]. Which one serves
//! unary calls is decided once, when the node is constructed, and captured as a
//! [`RouteMode`]; every dial then produces a [`TransportRoute`] of that shape.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::{
    errors::NodeError, http_client::{HttpClient, HttpTransport}, subscription::Subscription,
    websocket::WsTransport,
};
use crate::types::BatchElem;

/// Request/response JSON-RPC transport.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Performs a single call and returns its `result`.
    async fn call(&self, method: &str, params: Value) -> Result<Value, NodeError>;

    /// Performs a batch; per-element outcomes are written into `batch`.
    ///
    /// The returned error covers the batch as a whole (e.g. the connection failed).
    async fn batch_call(&self, batch: &mut [BatchElem]) -> Result<(), NodeError>;

    fn uri(&self) -> &str;

    /// Releases the connection. Idempotent; in-flight calls fail with `NodeError::Closed`.
    fn close(&self);
}

/// Transport that additionally supports `eth_subscribe` push subscriptions.
#[async_trait]
pub trait StreamingTransport: RpcTransport {
    /// Opens a subscription; `params` are the `eth_subscribe` parameters.
    async fn subscribe(&self, params: Value) -> Result<Subscription<Value>, NodeError>;

    /// Views this transport as a plain unary transport.
    fn as_unary(self: Arc<Self>) -> Arc<dyn RpcTransport>;
}

/// Result of dialing an endpoint.
#[derive(Clone, Default)]
pub struct Connection {
    pub primary: Option<Arc<dyn StreamingTransport>>,
    pub secondary: Option<Arc<dyn RpcTransport>>,
}

impl Connection {
    pub fn close(&self) {
        if let Some(primary) = &self.primary {
            primary.close();
        }
        if let Some(secondary) = &self.secondary {
            secondary.close();
        }
    }
}

/// Which transport serves unary calls, fixed when a node is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    PreferSecondary,
    PrimaryOnly,
}

/// A dialed connection resolved into explicit roles.
#[derive(Clone)]
pub enum TransportRoute {
    PreferSecondary { primary: Arc<dyn StreamingTransport>, secondary: Arc<dyn RpcTransport> },
    PrimaryOnly { primary: Arc<dyn StreamingTransport> },
}

impl TransportRoute {
    /// Resolves `connection` according to `mode`.
    ///
    /// # Errors
    /// Returns `NodeError::ConnectionFailed` if a transport required by `mode` is missing.
    pub fn resolve(mode: RouteMode, connection: Connection) -> Result<Self, NodeError> {
        let Some(primary) = connection.primary else {
            connection.close();
            return Err(NodeError::ConnectionFailed("no primary transport".into()));
        };
        match (mode, connection.secondary) {
            (RouteMode::PreferSecondary, Some(secondary)) => {
                Ok(Self::PreferSecondary { primary, secondary })
            }
            (RouteMode::PreferSecondary, None) => {
                primary.close();
                Err(NodeError::ConnectionFailed("no secondary transport".into()))
            }
            (RouteMode::PrimaryOnly, secondary) => {
                if let Some(secondary) = secondary {
                    secondary.close();
                }
                Ok(Self::PrimaryOnly { primary })
            }
        }
    }

    /// Transport used for request/response calls.
    #[must_use]
    pub fn unary(&self) -> Arc<dyn RpcTransport> {
        match self {
            Self::PreferSecondary { secondary, .. } => Arc::clone(secondary),
            Self::PrimaryOnly { primary } => Arc::clone(primary).as_unary(),
        }
    }

    /// Transport used for push subscriptions.
    #[must_use]
    pub fn streaming(&self) -> Arc<dyn StreamingTransport> {
        match self {
            Self::PreferSecondary { primary, .. } | Self::PrimaryOnly { primary } => {
                Arc::clone(primary)
            }
        }
    }

    #[must_use]
    pub fn mode(&self) -> RouteMode {
        match self {
            Self::PreferSecondary { .. } => RouteMode::PreferSecondary,
            Self::PrimaryOnly { .. } => RouteMode::PrimaryOnly,
        }
    }

    pub fn close(&self) {
        match self {
            Self::PreferSecondary { primary, secondary } => {
                primary.close();
                secondary.close();
            }
            Self::PrimaryOnly { primary } => primary.close(),
        }
    }
}

/// Dials an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, NodeError>;
}

/// Production connector: WebSocket primary, optional HTTP secondary.
pub struct WsHttpConnector {
    ws_url: Option<Url>,
    http_url: Option<Url>,
    http_client: Arc<HttpClient>,
    request_timeout: Duration,
}

impl WsHttpConnector {
    #[must_use]
    pub fn new(
        ws_url: Option<Url>,
        http_url: Option<Url>,
        http_client: Arc<HttpClient>,
        request_timeout: Duration,
    ) -> Self {
        Self { ws_url, http_url, http_client, request_timeout }
    }
}

#[async_trait]
impl Connector for WsHttpConnector {
    async fn connect(&self) -> Result<Connection, NodeError> {
        let primary: Option<Arc<dyn StreamingTransport>> = match &self.ws_url {
            Some(url) => {
                let ws = WsTransport::connect(url, self.request_timeout).await?;
                Some(Arc::new(ws) as Arc<dyn StreamingTransport>)
            }
            None => None,
        };
        let secondary: Option<Arc<dyn RpcTransport>> = self.http_url.as_ref().map(|url| {
            Arc::new(HttpTransport::new(
                Arc::clone(&self.http_client),
                url.as_str(),
                self.request_timeout,
            )) as Arc<dyn RpcTransport>
        });
        Ok(Connection { primary, secondary })
    }
}
