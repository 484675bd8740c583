//! Node lifecycle scenarios driven through a real pool against mock endpoints.
//!
//! Every test runs on the current-thread runtime so [`LogCapture`] sees events from the
//! spawned monitor loops.

use std::{collections::HashSet, sync::Arc, time::Duration};

use lattice_core::{
    config::{PoolConfig, SelectionMode},
    metrics::{RecordingSink, NODE_DIALS_FAILED, NODE_TRANSITIONS_TOTAL},
    upstream::{NodeError, NodeSpec, NodeState, Pool, PoolBuilder},
};
use tokio_util::sync::CancellationToken;

use crate::mock_infrastructure::{
    fast_pool_config, mock_node, wait_for, wait_for_state, LogCapture, MockEndpoint,
    TEST_CHAIN_ID,
};

const SETTLE: Duration = Duration::from_secs(2);

fn endpoints(names: &[&str]) -> Vec<Arc<MockEndpoint>> {
    names.iter().map(|name| MockEndpoint::new(name, TEST_CHAIN_ID)).collect()
}

fn build_pool(config: PoolConfig, endpoints: &[Arc<MockEndpoint>], sink: &Arc<RecordingSink>) -> Pool {
    endpoints
        .iter()
        .fold(PoolBuilder::new(config), |builder, endpoint| {
            builder.node(NodeSpec::primary(endpoint.name(), endpoint.connector()))
        })
        .metrics_sink(Arc::clone(sink) as _)
        .build()
        .unwrap()
}

async fn all_alive(pool: &Pool) -> bool {
    wait_for(SETTLE, || pool.nodes().iter().all(|n| n.state() == NodeState::Alive)).await
}

/// Pushes increasing heads to `endpoint` until `stop` is cancelled.
fn feed_heads(endpoint: Arc<MockEndpoint>, every: Duration, stop: CancellationToken) {
    tokio::spawn(async move {
        let mut number = 1;
        loop {
            tokio::select! {
                () = stop.cancelled() => return,
                () = tokio::time::sleep(every) => {}
            }
            endpoint.push_head(number);
            number += 1;
        }
    });
}

#[tokio::test]
async fn test_closed_head_subscription_removes_node_until_redialed() {
    let (logs, _guard) = LogCapture::install();
    let sink = Arc::new(RecordingSink::new());
    let config = PoolConfig {
        no_new_heads_threshold_ms: 60_000,
        ..fast_pool_config(SelectionMode::RoundRobin)
    };
    let eps = endpoints(&["a", "b", "c"]);
    let pool = build_pool(config, &eps, &sink);

    pool.dial().await.unwrap();
    assert!(all_alive(&pool).await);
    assert!(wait_for(SETTLE, || eps.iter().all(|e| e.open_subscriptions() == 1)).await);

    let victim = &eps[0];
    let node_a = Arc::clone(&pool.nodes()[0]);
    victim.set_reachable(false);
    victim.close_subscriptions();

    assert!(wait_for_state(&node_a, NodeState::Unreachable, SETTLE).await);
    assert!(logs.contains("Subscription channel unexpectedly closed"));
    for _ in 0..30 {
        let node = pool.select_node().unwrap();
        assert_ne!(node.name(), "a", "unreachable node must not be selected");
    }

    victim.set_reachable(true);
    assert!(wait_for_state(&node_a, NodeState::Alive, SETTLE).await);
    assert!(victim.dials() >= 2);
    assert!(victim.calls("eth_chainId") >= 2, "redial re-verifies the chain id");

    let picked: HashSet<String> =
        (0..6).map(|_| pool.select_node().unwrap().name().to_string()).collect();
    assert!(picked.contains("a"));

    pool.close().await;
}

#[tokio::test]
async fn test_last_node_stays_alive_without_new_heads() {
    let (logs, _guard) = LogCapture::install();
    let sink = Arc::new(RecordingSink::new());
    let config = PoolConfig {
        no_new_heads_threshold_ms: 100,
        ..fast_pool_config(SelectionMode::HighestHead)
    };
    let eps = endpoints(&["solo"]);
    let pool = build_pool(config, &eps, &sink);

    pool.dial().await.unwrap();
    assert!(all_alive(&pool).await);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let node = &pool.nodes()[0];
    assert_eq!(node.state(), NodeState::Alive);
    assert_eq!(pool.select_node().unwrap().name(), "solo");
    // Re-armed at half the threshold, so the warning repeats.
    assert!(logs.count("RPC endpoint detected out of sync") >= 2);
    assert!(logs.contains("degraded state"));
    let out_of_sync = [
        ("chain_id", TEST_CHAIN_ID.to_string()),
        ("node", "solo".to_string()),
        ("state", "out_of_sync".to_string()),
    ];
    assert_eq!(sink.counter(NODE_TRANSITIONS_TOTAL, &out_of_sync), 0);

    pool.close().await;
}

#[tokio::test]
async fn test_stalled_node_goes_out_of_sync_and_recovers_on_newer_head() {
    let (logs, _guard) = LogCapture::install();
    let sink = Arc::new(RecordingSink::new());
    let config = PoolConfig {
        no_new_heads_threshold_ms: 150,
        ..fast_pool_config(SelectionMode::HighestHead)
    };
    let eps = endpoints(&["stalled", "healthy"]);
    let pool = build_pool(config, &eps, &sink);
    let stop = CancellationToken::new();

    pool.dial().await.unwrap();
    assert!(all_alive(&pool).await);
    feed_heads(Arc::clone(&eps[1]), Duration::from_millis(20), stop.clone());

    let stalled = Arc::clone(&pool.nodes()[0]);
    assert!(wait_for_state(&stalled, NodeState::OutOfSync, SETTLE).await);
    assert!(logs.contains("no new heads received"));
    assert_eq!(pool.select_node().unwrap().name(), "healthy");

    // The out-of-sync loop redials and resubscribes; any head newer than the last one
    // seen brings the node back.
    assert!(
        wait_for(SETTLE, || {
            eps[0].push_head(7);
            stalled.state() == NodeState::Alive
        })
        .await
    );
    assert!(logs.contains("RPC node back in sync"));
    assert!(eps[0].dials() >= 2);
    assert_eq!(stalled.chain_info().block_number, 7);

    stop.cancel();
    pool.close().await;
}

#[tokio::test]
async fn test_wrong_chain_id_is_retried_until_it_matches() {
    let (logs, _guard) = LogCapture::install();
    let sink = Arc::new(RecordingSink::new());
    let eps = endpoints(&["forked"]);
    eps[0].set_chain_id(99);
    let pool = build_pool(fast_pool_config(SelectionMode::HighestHead), &eps, &sink);

    pool.dial().await.unwrap();
    let node = Arc::clone(&pool.nodes()[0]);
    assert!(wait_for_state(&node, NodeState::InvalidChainId, SETTLE).await);
    assert!(
        wait_for(SETTLE, || {
            logs.contains("Failed to verify RPC node; remote endpoint returned the wrong chain ID")
        })
        .await
    );
    assert!(pool.select_node().is_err());

    eps[0].set_chain_id(TEST_CHAIN_ID);
    assert!(wait_for_state(&node, NodeState::Alive, SETTLE).await);

    pool.close().await;
}

#[tokio::test]
async fn test_poll_failures_mark_node_unreachable() {
    let (logs, _guard) = LogCapture::install();
    let sink = Arc::new(RecordingSink::new());
    let config = PoolConfig {
        poll_interval_ms: 20,
        poll_failure_threshold: 2,
        ..fast_pool_config(SelectionMode::RoundRobin)
    };
    let eps = endpoints(&["flaky", "steady"]);
    eps[0].respond_error("web3_clientVersion", "internal error");
    let pool = build_pool(config, &eps, &sink);

    pool.dial().await.unwrap();
    assert!(
        wait_for(SETTLE, || logs.contains("RPC endpoint failed to respond to 2 consecutive polls"))
            .await
    );
    assert!(logs.contains("Poll failure, RPC endpoint flaky failed to respond properly"));
    let unreachable = [
        ("chain_id", TEST_CHAIN_ID.to_string()),
        ("node", "flaky".to_string()),
        ("state", "unreachable".to_string()),
    ];
    assert!(wait_for(SETTLE, || sink.counter(NODE_TRANSITIONS_TOTAL, &unreachable) >= 1).await);
    assert_eq!(pool.nodes()[1].state(), NodeState::Alive);

    pool.close().await;
}

#[tokio::test]
async fn test_last_node_survives_poll_failures() {
    let (logs, _guard) = LogCapture::install();
    let sink = Arc::new(RecordingSink::new());
    let config = PoolConfig {
        poll_interval_ms: 20,
        poll_failure_threshold: 2,
        ..fast_pool_config(SelectionMode::HighestHead)
    };
    let eps = endpoints(&["solo"]);
    eps[0].respond_error("web3_clientVersion", "internal error");
    let pool = build_pool(config, &eps, &sink);

    pool.dial().await.unwrap();
    assert!(wait_for(SETTLE, || logs.contains("consecutive polls; but cannot disable")).await);
    assert_eq!(pool.nodes()[0].state(), NodeState::Alive);

    pool.close().await;
}

#[tokio::test]
async fn test_unreachable_endpoint_is_redialed_with_backoff() {
    let (logs, _guard) = LogCapture::install();
    let sink = Arc::new(RecordingSink::new());
    let eps = endpoints(&["down"]);
    eps[0].set_reachable(false);
    let pool = build_pool(fast_pool_config(SelectionMode::HighestHead), &eps, &sink);

    pool.dial().await.unwrap();
    let node = Arc::clone(&pool.nodes()[0]);
    assert!(wait_for_state(&node, NodeState::Unreachable, SETTLE).await);
    assert!(logs.contains("Dial failed: Node is unreachable"));
    assert!(wait_for(SETTLE, || eps[0].dials() >= 3).await);
    assert!(logs.contains("Failed to redial RPC node; still unreachable"));

    eps[0].set_reachable(true);
    assert!(wait_for_state(&node, NodeState::Alive, SETTLE).await);

    pool.close().await;
}

#[tokio::test]
async fn test_close_stops_loops_and_subscriptions() {
    let sink = Arc::new(RecordingSink::new());
    let config = PoolConfig {
        no_new_heads_threshold_ms: 60_000,
        ..fast_pool_config(SelectionMode::HighestHead)
    };
    let eps = endpoints(&["a", "b"]);
    let pool = build_pool(config, &eps, &sink);

    pool.dial().await.unwrap();
    assert!(all_alive(&pool).await);
    let sub = pool.subscribe_new_heads().await.unwrap();
    assert!(wait_for(SETTLE, || eps.iter().map(|e| e.open_subscriptions()).sum::<usize>() == 3).await);

    pool.close().await;
    pool.close().await;

    for node in pool.nodes() {
        assert_eq!(node.state(), NodeState::Closed);
        assert!(!node.has_running_monitor());
        assert_eq!(node.subscription_count(), 0);
    }
    assert!(sub.handle().is_stopped());
    assert!(wait_for(SETTLE, || eps.iter().all(|e| e.open_subscriptions() == 0)).await);
    assert!(pool.select_node().is_err());
}

#[tokio::test]
async fn test_node_serves_calls_only_while_alive() {
    let sink = Arc::new(RecordingSink::new());
    let config = fast_pool_config(SelectionMode::HighestHead);
    let endpoint = MockEndpoint::new("direct", TEST_CHAIN_ID);
    endpoint.set_reachable(false);
    let node = mock_node(&endpoint, 0, &config, &sink);

    node.start().await.unwrap();
    assert!(wait_for_state(&node, NodeState::Unreachable, SETTLE).await);
    let err = node.block_number().await.unwrap_err();
    assert_eq!(err.to_string(), "cannot execute RPC call on node direct in state Unreachable");
    assert_eq!(endpoint.calls("eth_blockNumber"), 0);
    let labels = [("chain_id", TEST_CHAIN_ID.to_string()), ("node", "direct".to_string())];
    assert!(sink.counter(NODE_DIALS_FAILED, &labels) >= 1);

    endpoint.set_reachable(true);
    assert!(wait_for_state(&node, NodeState::Alive, SETTLE).await);
    assert_eq!(node.block_number().await.unwrap(), 16);
    assert_eq!(node.client_version().await.unwrap(), "MockClient/direct");

    node.close().await;
    assert_eq!(node.state(), NodeState::Closed);
    assert!(matches!(node.block_number().await, Err(NodeError::InvalidState { .. })));
    assert!(node.start().await.is_err());
}

#[tokio::test]
async fn test_out_of_sync_node_is_forced_alive_when_no_other_node_is_left() {
    let (logs, _guard) = LogCapture::install();
    let sink = Arc::new(RecordingSink::new());
    let config = PoolConfig {
        no_new_heads_threshold_ms: 150,
        ..fast_pool_config(SelectionMode::HighestHead)
    };
    let eps = endpoints(&["stalled", "healthy"]);
    let pool = build_pool(config, &eps, &sink);
    let stop = CancellationToken::new();

    pool.dial().await.unwrap();
    assert!(all_alive(&pool).await);
    feed_heads(Arc::clone(&eps[1]), Duration::from_millis(20), stop.clone());

    let stalled = Arc::clone(&pool.nodes()[0]);
    let healthy = Arc::clone(&pool.nodes()[1]);
    assert!(wait_for_state(&stalled, NodeState::OutOfSync, SETTLE).await);

    stop.cancel();
    eps[1].set_reachable(false);
    eps[1].close_subscriptions();
    assert!(wait_for_state(&healthy, NodeState::Unreachable, SETTLE).await);

    assert!(wait_for_state(&stalled, NodeState::Alive, SETTLE).await);
    assert!(logs.contains("This RPC node will be forcibly moved back into the live pool in a degraded state"));
    assert_eq!(pool.select_node().unwrap().name(), "stalled");

    pool.close().await;
}

#[tokio::test]
async fn test_redialed_node_with_wrong_chain_id_becomes_invalid() {
    let (logs, _guard) = LogCapture::install();
    let sink = Arc::new(RecordingSink::new());
    let eps = endpoints(&["moved"]);
    eps[0].set_reachable(false);
    let pool = build_pool(fast_pool_config(SelectionMode::HighestHead), &eps, &sink);

    pool.dial().await.unwrap();
    let node = Arc::clone(&pool.nodes()[0]);
    assert!(wait_for_state(&node, NodeState::Unreachable, SETTLE).await);

    eps[0].set_chain_id(99);
    eps[0].set_reachable(true);
    assert!(wait_for_state(&node, NodeState::InvalidChainId, SETTLE).await);
    assert!(logs.contains("redialed RPC node has the wrong chain id"));

    eps[0].set_chain_id(TEST_CHAIN_ID);
    assert!(wait_for_state(&node, NodeState::Alive, SETTLE).await);

    pool.close().await;
}

#[tokio::test]
async fn test_out_of_sync_node_failing_verification_becomes_invalid() {
    let (logs, _guard) = LogCapture::install();
    let sink = Arc::new(RecordingSink::new());
    let config = PoolConfig {
        no_new_heads_threshold_ms: 150,
        ..fast_pool_config(SelectionMode::HighestHead)
    };
    let eps = endpoints(&["forked", "erroring", "healthy"]);
    let pool = build_pool(config, &eps, &sink);
    let stop = CancellationToken::new();

    pool.dial().await.unwrap();
    assert!(all_alive(&pool).await);
    eps[0].set_chain_id(99);
    eps[1].respond_error("eth_chainId", "internal error");
    feed_heads(Arc::clone(&eps[2]), Duration::from_millis(20), stop.clone());

    // Mismatch parks the node in InvalidChainId.
    let forked = Arc::clone(&pool.nodes()[0]);
    assert!(wait_for_state(&forked, NodeState::InvalidChainId, SETTLE).await);
    assert!(logs.contains("out-of-sync RPC node has the wrong chain id"));

    // A failed verify takes the same path before the invalid-chain loop gives up on it.
    let invalid = |name: &str| {
        [
            ("chain_id", TEST_CHAIN_ID.to_string()),
            ("node", name.to_string()),
            ("state", "invalid_chain_id".to_string()),
        ]
    };
    assert!(
        wait_for(SETTLE, || sink.counter(NODE_TRANSITIONS_TOTAL, &invalid("erroring")) >= 1).await
    );
    assert!(logs.contains("failed to verify out-of-sync RPC node"));
    assert!(sink.counter(NODE_TRANSITIONS_TOTAL, &invalid("forked")) >= 1);
    assert_eq!(pool.nodes()[2].state(), NodeState::Alive);

    stop.cancel();
    pool.close().await;
}

#[tokio::test]
async fn test_invalid_chain_id_node_goes_unreachable_when_verify_errors() {
    let (logs, _guard) = LogCapture::install();
    let sink = Arc::new(RecordingSink::new());
    let eps = endpoints(&["forked"]);
    eps[0].set_chain_id(99);
    let pool = build_pool(fast_pool_config(SelectionMode::HighestHead), &eps, &sink);

    pool.dial().await.unwrap();
    let node = Arc::clone(&pool.nodes()[0]);
    assert!(wait_for_state(&node, NodeState::InvalidChainId, SETTLE).await);

    eps[0].respond_error("eth_chainId", "internal error");
    assert!(wait_for_state(&node, NodeState::Unreachable, SETTLE).await);
    assert!(logs.contains("Unexpected error while verifying RPC node chain ID"));
    assert!(pool.select_node().is_err());

    pool.close().await;
}

#[tokio::test]
async fn test_send_only_node_with_wrong_chain_id_is_unreachable_until_it_matches() {
    let (logs, _guard) = LogCapture::install();
    let sink = Arc::new(RecordingSink::new());
    let main = MockEndpoint::new("main", TEST_CHAIN_ID);
    let relay = MockEndpoint::new("relay", 99);
    let pool = PoolBuilder::new(fast_pool_config(SelectionMode::HighestHead))
        .node(NodeSpec::primary(main.name(), main.connector()))
        .node(NodeSpec::send_only(relay.name(), relay.connector()))
        .metrics_sink(Arc::clone(&sink) as _)
        .build()
        .unwrap();

    pool.dial().await.unwrap();
    let send_only = Arc::clone(&pool.send_only_nodes()[0]);
    assert!(wait_for(SETTLE, || send_only.state() == NodeState::Unreachable).await);
    assert!(
        wait_for(SETTLE, || logs.count("sendonly rpc chain id does not match local chain id") >= 2)
            .await
    );
    assert_eq!(pool.node_states()["relay"], "Unreachable");

    assert!(all_alive(&pool).await);
    pool.send_transaction("0x02f8").await.unwrap();
    assert_eq!(relay.calls("eth_sendRawTransaction"), 0);

    relay.set_chain_id(TEST_CHAIN_ID);
    assert!(wait_for(SETTLE, || send_only.state() == NodeState::Alive).await);
    assert!(logs.contains("Sendonly RPC Node is online"));

    pool.close().await;
}
