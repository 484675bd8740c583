//! # Metrics
//!
//! Pool and node code never touch a recorder directly; they report through a
//! [`MetricsSink`] injected at construction. [`PoolMetrics`] gives the recorded series
//! their names and label sets.
//!
//! Three sinks ship with the crate:
//!
//! | Sink | Use |
//! |------|-----|
//! | [`PrometheusSink`] | forwards to the `metrics` facade; pair with [`install_prometheus_recorder`] |
//! | [`NoopSink`] | discards everything |
//! | [`RecordingSink`] | keeps values in memory so tests can assert on them |

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use dashmap::DashMap;
use metrics::{counter, gauge, histogram, Label};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::{types::ChainId, upstream::node_state::NodeState};

pub type Labels<'a> = &'a [(&'static str, String)];

/// Destination for pool metrics.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, labels: Labels<'_>, value: u64);
    fn set(&self, name: &'static str, labels: Labels<'_>, value: f64);
    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

/// Types that can be rendered as a metric label and gauge value.
pub trait MetricsState {
    fn as_metric_str(&self) -> &'static str;
    fn as_gauge_value(&self) -> f64;
}

impl MetricsState for NodeState {
    fn as_metric_str(&self) -> &'static str {
        NodeState::as_metric_str(self)
    }

    fn as_gauge_value(&self) -> f64 {
        match self {
            Self::Alive => 1.0,
            Self::OutOfSync | Self::Dialed => 0.5,
            Self::Undialed | Self::InvalidChainId | Self::Unreachable | Self::Closed => 0.0,
        }
    }
}

fn to_labels(labels: Labels<'_>) -> Vec<Label> {
    labels.iter().map(|(k, v)| Label::new(*k, v.clone())).collect()
}

/// Forwards to whatever recorder is installed for the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn increment(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        counter!(name, to_labels(labels)).increment(value);
    }

    fn set(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        gauge!(name, to_labels(labels)).set(value);
    }

    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        histogram!(name, to_labels(labels)).record(value);
    }
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder once and returns its render handle.
///
/// Falls back to a detached recorder when another recorder is already installed.
pub fn install_prometheus_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "failed to install prometheus recorder; using a detached recorder"
                );
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment(&self, _: &'static str, _: Labels<'_>, _: u64) {}
    fn set(&self, _: &'static str, _: Labels<'_>, _: f64) {}
    fn observe(&self, _: &'static str, _: Labels<'_>, _: f64) {}
}

/// In-memory sink keyed by `name{k=v,...}`.
#[derive(Debug, Default)]
pub struct RecordingSink {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    observations: DashMap<String, Vec<f64>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, labels: Labels<'_>) -> String {
        let mut sorted: Vec<_> = labels.iter().collect();
        sorted.sort_by_key(|(k, _)| *k);
        let rendered: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{name}{{{}}}", rendered.join(","))
    }

    #[must_use]
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters.get(&Self::key(name, labels)).map_or(0, |v| *v)
    }

    #[must_use]
    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        self.gauges.get(&Self::key(name, labels)).map(|v| *v)
    }

    #[must_use]
    pub fn observations(&self, name: &str, labels: Labels<'_>) -> Vec<f64> {
        self.observations.get(&Self::key(name, labels)).map(|v| v.clone()).unwrap_or_default()
    }

    /// Sum of a counter across every label set.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        let prefix = format!("{name}{{");
        self.counters.iter().filter(|e| e.key().starts_with(&prefix)).map(|e| *e.value()).sum()
    }
}

impl MetricsSink for RecordingSink {
    fn increment(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        *self.counters.entry(Self::key(name, labels)).or_insert(0) += value;
    }

    fn set(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.gauges.insert(Self::key(name, labels), value);
    }

    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.observations.entry(Self::key(name, labels)).or_default().push(value);
    }
}

pub const NODE_DIALS_TOTAL: &str = "pool_rpc_node_dials_total";
pub const NODE_DIALS_FAILED: &str = "pool_rpc_node_dials_failed";
pub const NODE_DIALS_SUCCESS: &str = "pool_rpc_node_dials_success";
pub const NODE_CALLS_TOTAL: &str = "pool_rpc_node_calls_total";
pub const NODE_CALLS_FAILED: &str = "pool_rpc_node_calls_failed";
pub const NODE_CALLS_SUCCESS: &str = "pool_rpc_node_calls_success";
pub const CALL_TIME_SECONDS: &str = "pool_rpc_call_time_seconds";
pub const NODE_VERIFIES_TOTAL: &str = "pool_rpc_node_verifies_total";
pub const NODE_VERIFIES_FAILED: &str = "pool_rpc_node_verifies_failed";
pub const NODE_VERIFIES_SUCCESS: &str = "pool_rpc_node_verifies_success";
pub const NODE_TRANSITIONS_TOTAL: &str = "pool_rpc_node_transitions_total";
pub const NODE_STATE: &str = "pool_rpc_node_state";
pub const NODE_POLLS_TOTAL: &str = "pool_rpc_node_polls_total";
pub const NODE_POLLS_FAILED: &str = "pool_rpc_node_polls_failed";
pub const NODE_POLLS_SUCCESS: &str = "pool_rpc_node_polls_success";
pub const NODE_HIGHEST_SEEN_BLOCK: &str = "pool_rpc_node_highest_seen_block";
pub const NODE_HIGHEST_SEEN_TD: &str = "pool_rpc_node_highest_seen_td";
pub const NODE_NUM_SEEN_BLOCKS: &str = "pool_rpc_node_num_seen_blocks";
pub const POOL_LIVE_NODES: &str = "pool_live_nodes";

/// Named recorders for one pool.
#[derive(Clone)]
pub struct PoolMetrics {
    sink: Arc<dyn MetricsSink>,
    chain_id: String,
}

impl std::fmt::Debug for PoolMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMetrics").field("chain_id", &self.chain_id).finish_non_exhaustive()
    }
}

impl PoolMetrics {
    #[must_use]
    pub fn new(sink: Arc<dyn MetricsSink>, chain_id: ChainId) -> Self {
        Self { sink, chain_id: chain_id.to_string() }
    }

    #[must_use]
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopSink), 0)
    }

    fn node_labels(&self, node: &str) -> [(&'static str, String); 2] {
        [("chain_id", self.chain_id.clone()), ("node", node.to_string())]
    }

    fn outcome(&self, node: &str, ok: bool, total: &'static str, success: &'static str, failed: &'static str) {
        let labels = self.node_labels(node);
        self.sink.increment(total, &labels, 1);
        self.sink.increment(if ok { success } else { failed }, &labels, 1);
    }

    pub fn dial(&self, node: &str, ok: bool) {
        self.outcome(node, ok, NODE_DIALS_TOTAL, NODE_DIALS_SUCCESS, NODE_DIALS_FAILED);
    }

    pub fn verify(&self, node: &str, ok: bool) {
        self.outcome(node, ok, NODE_VERIFIES_TOTAL, NODE_VERIFIES_SUCCESS, NODE_VERIFIES_FAILED);
    }

    pub fn poll(&self, node: &str, ok: bool) {
        self.outcome(node, ok, NODE_POLLS_TOTAL, NODE_POLLS_SUCCESS, NODE_POLLS_FAILED);
    }

    pub fn call(&self, node: &str, method: &str, ok: bool, elapsed: Duration) {
        self.outcome(node, ok, NODE_CALLS_TOTAL, NODE_CALLS_SUCCESS, NODE_CALLS_FAILED);
        let labels = [
            ("chain_id", self.chain_id.clone()),
            ("node", node.to_string()),
            ("method", method.to_string()),
        ];
        self.sink.observe(CALL_TIME_SECONDS, &labels, elapsed.as_secs_f64());
    }

    pub fn transition(&self, node: &str, state: NodeState) {
        let labels = [
            ("chain_id", self.chain_id.clone()),
            ("node", node.to_string()),
            ("state", state.as_metric_str().to_string()),
        ];
        self.sink.increment(NODE_TRANSITIONS_TOTAL, &labels, 1);
        self.sink.set(NODE_STATE, &self.node_labels(node), MetricsState::as_gauge_value(&state));
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn seen_head(&self, node: &str, number: i64, total_difficulty: Option<u128>) {
        let labels = self.node_labels(node);
        self.sink.increment(NODE_NUM_SEEN_BLOCKS, &labels, 1);
        self.sink.set(NODE_HIGHEST_SEEN_BLOCK, &labels, number as f64);
        if let Some(td) = total_difficulty {
            self.sink.set(NODE_HIGHEST_SEEN_TD, &labels, td as f64);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn live_nodes(&self, count: usize) {
        self.sink.set(POOL_LIVE_NODES, &[("chain_id", self.chain_id.clone())], count as f64);
    }
}
