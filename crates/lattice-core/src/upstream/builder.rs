//! Builder pattern for constructing a [`Pool`] from code or from [`LatticeConfig`].

use std::{collections::HashSet, sync::Arc};

use thiserror::Error;
use url::Url;

use super::{
    http_client::HttpClient,
    node::{Node, NodeSettings},
    pool::Pool,
    send_only::SendOnlyNode,
    transport::{Connector, RouteMode, WsHttpConnector},
};
use crate::{
    config::{LatticeConfig, PoolConfig},
    metrics::{install_prometheus_recorder, MetricsSink, NoopSink, PoolMetrics, PrometheusSink},
    types::ChainId,
};

/// Errors that can occur during pool construction.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuilderError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid URL for node {name}: {url}")]
    InvalidUrl {
        name: String,
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("duplicate node name: {0}")]
    DuplicateName(String),

    /// HTTP client initialization failed
    #[error("failed to initialize HTTP client: {0}")]
    HttpClientInit(String),
}

/// One endpoint to add to the pool.
pub struct NodeSpec {
    pub name: String,
    pub order: i32,
    /// Overrides the pool's chain ID for this node.
    pub chain_id: Option<ChainId>,
    pub route_mode: RouteMode,
    pub send_only: bool,
    pub connector: Arc<dyn Connector>,
}

impl NodeSpec {
    /// Primary node with default order, unary calls over the primary transport.
    #[must_use]
    pub fn primary(name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            name: name.into(),
            order: 100,
            chain_id: None,
            route_mode: RouteMode::PrimaryOnly,
            send_only: false,
            connector,
        }
    }

    #[must_use]
    pub fn send_only(name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self { send_only: true, ..Self::primary(name, connector) }
    }

    #[must_use]
    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn chain_id(mut self, chain_id: ChainId) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    #[must_use]
    pub fn route_mode(mut self, route_mode: RouteMode) -> Self {
        self.route_mode = route_mode;
        self
    }
}

/// Builder for constructing a [`Pool`].
///
/// # Examples
///
/// ```no_run
/// # use lattice_core::{config::PoolConfig, upstream::{NodeSpec, PoolBuilder, Connector}};
/// # use std::sync::Arc;
/// # async fn example(connector: Arc<dyn Connector>) -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PoolBuilder::new(PoolConfig { chain_id: 1, ..PoolConfig::default() })
///     .node(NodeSpec::primary("primary-a", connector).order(1))
///     .build()?;
/// pool.dial().await?;
/// # Ok(())
/// # }
/// ```
pub struct PoolBuilder {
    config: PoolConfig,
    specs: Vec<NodeSpec>,
    sink: Arc<dyn MetricsSink>,
}

impl PoolBuilder {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self { config, specs: Vec::new(), sink: Arc::new(NoopSink) }
    }

    /// Builds a pool from a validated [`LatticeConfig`], wiring a WebSocket/HTTP connector
    /// for every configured node. With `metrics.enabled` the global Prometheus recorder is
    /// installed and the pool reports through it.
    ///
    /// # Errors
    /// Fails if the configuration does not validate, a URL does not parse, or the shared
    /// HTTP client cannot be created.
    pub fn from_config(config: &LatticeConfig) -> Result<Self, BuilderError> {
        config.validate().map_err(BuilderError::InvalidConfig)?;

        let http_client = Arc::new(
            HttpClient::new().map_err(|e| BuilderError::HttpClientInit(e.to_string()))?,
        );
        let timeout = config.pool.request_timeout();
        let parse = |name: &str, url: &Option<String>| -> Result<Option<Url>, BuilderError> {
            url.as_deref()
                .map(|u| {
                    Url::parse(u).map_err(|source| BuilderError::InvalidUrl {
                        name: name.to_string(),
                        url: u.to_string(),
                        source,
                    })
                })
                .transpose()
        };

        let mut builder = Self::new(config.pool.clone());
        if config.metrics.enabled {
            install_prometheus_recorder();
            builder = builder.metrics_sink(Arc::new(PrometheusSink));
        }
        for node in &config.nodes {
            let http_url = parse(&node.name, &node.http_url)?;
            let ws_url = if node.send_only { None } else { parse(&node.name, &node.ws_url)? };
            let route_mode =
                if http_url.is_some() { RouteMode::PreferSecondary } else { RouteMode::PrimaryOnly };
            let connector: Arc<dyn Connector> = Arc::new(WsHttpConnector::new(
                ws_url,
                http_url,
                Arc::clone(&http_client),
                timeout,
            ));
            let spec = if node.send_only {
                NodeSpec::send_only(node.name.clone(), connector)
            } else {
                NodeSpec::primary(node.name.clone(), connector).route_mode(route_mode)
            };
            builder = builder.node(spec.order(node.order));
        }
        Ok(builder)
    }

    #[must_use]
    pub fn node(mut self, spec: NodeSpec) -> Self {
        self.specs.push(spec);
        self
    }

    #[must_use]
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Builds the pool. Nodes are indexed in the order they were added.
    ///
    /// # Errors
    /// Returns `BuilderError::DuplicateName` if two nodes share a name.
    pub fn build(self) -> Result<Pool, BuilderError> {
        let mut seen = HashSet::new();
        for spec in &self.specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(BuilderError::DuplicateName(spec.name.clone()));
            }
        }

        let metrics = PoolMetrics::new(self.sink, self.config.chain_id);
        let settings = NodeSettings::from(&self.config);
        let mut nodes = Vec::new();
        let mut send_only = Vec::new();
        for spec in self.specs {
            let chain_id = spec.chain_id.unwrap_or(self.config.chain_id);
            if spec.send_only {
                send_only.push(SendOnlyNode::new(
                    spec.name,
                    chain_id,
                    spec.connector,
                    settings.clone(),
                    metrics.clone(),
                ));
            } else {
                let index = nodes.len();
                nodes.push(Node::new(
                    spec.name,
                    index,
                    spec.order,
                    chain_id,
                    spec.route_mode,
                    spec.connector,
                    settings.clone(),
                    metrics.clone(),
                ));
            }
        }
        Ok(Pool::new(self.config, nodes, send_only, metrics))
    }
}
