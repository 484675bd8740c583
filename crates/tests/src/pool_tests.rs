//! Pool orchestration: dialing, read dispatch, selection, lease switching and sweep.

use std::{sync::Arc, time::Duration};

use lattice_core::{
    config::{PoolConfig, SelectionMode},
    metrics::{RecordingSink, CALL_TIME_SECONDS, POOL_LIVE_NODES},
    types::BatchElem,
    upstream::{NodeSpec, NodeState, Pool, PoolBuilder, PoolError},
    utils::BlockRef,
};
use serde_json::json;

use crate::mock_infrastructure::{
    create_test_block, create_test_receipt, fast_pool_config, head_json, wait_for,
    wait_for_state, LogCapture, MockEndpoint, TEST_CHAIN_ID,
};

const SETTLE: Duration = Duration::from_secs(2);

struct Harness {
    pool: Pool,
    primaries: Vec<Arc<MockEndpoint>>,
    send_only: Vec<Arc<MockEndpoint>>,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new(config: PoolConfig, primaries: &[&str], send_only: &[&str]) -> Self {
        let sink = Arc::new(RecordingSink::new());
        let primaries: Vec<_> =
            primaries.iter().map(|n| MockEndpoint::new(n, TEST_CHAIN_ID)).collect();
        let send_only: Vec<_> =
            send_only.iter().map(|n| MockEndpoint::new(n, TEST_CHAIN_ID)).collect();

        let mut builder = PoolBuilder::new(config).metrics_sink(Arc::clone(&sink) as _);
        for (i, endpoint) in primaries.iter().enumerate() {
            let order = i32::try_from(i).unwrap_or(i32::MAX) + 1;
            builder = builder.node(NodeSpec::primary(endpoint.name(), endpoint.connector()).order(order));
        }
        for endpoint in &send_only {
            builder = builder.node(NodeSpec::send_only(endpoint.name(), endpoint.connector()));
        }
        Self { pool: builder.build().unwrap(), primaries, send_only, sink }
    }

    async fn dial_and_settle(&self) {
        self.pool.dial().await.unwrap();
        let pool = &self.pool;
        assert!(
            wait_for(SETTLE, || {
                pool.nodes().iter().all(|n| n.state() == NodeState::Alive) &&
                    pool.send_only_nodes().iter().all(|n| n.state() == NodeState::Alive)
            })
            .await,
            "pool did not settle: {:?}",
            pool.node_states()
        );
    }
}

#[tokio::test]
async fn test_reads_are_served_by_selected_node() {
    let h = Harness::new(fast_pool_config(SelectionMode::HighestHead), &["a"], &[]);
    let endpoint = &h.primaries[0];
    endpoint.respond("eth_getBlockByNumber", Ok(create_test_block(42, 2)));
    endpoint.respond("eth_getTransactionReceipt", Ok(json!(null)));
    endpoint.respond("eth_getBalance", Ok(json!("0xde0b6b3a7640000")));
    endpoint.respond("eth_getTransactionCount", Ok(json!("0x7")));
    endpoint.respond("eth_gasPrice", Ok(json!("0x3b9aca00")));
    h.dial_and_settle().await;

    assert_eq!(h.pool.chain_id().await.unwrap(), TEST_CHAIN_ID);
    assert_eq!(h.pool.block_number().await.unwrap(), 16);
    assert_eq!(
        h.pool.balance_at("0x0000000000000000000000000000000000000001", BlockRef::Latest).await.unwrap(),
        1_000_000_000_000_000_000
    );
    assert_eq!(h.pool.pending_nonce_at("0x0000000000000000000000000000000000000001").await.unwrap(), 7);
    assert_eq!(h.pool.suggest_gas_price().await.unwrap(), 1_000_000_000);
    assert!(h.pool.transaction_receipt("0xabc").await.unwrap().is_none());

    let head = h.pool.header_by_number(BlockRef::Number(42)).await.unwrap().unwrap();
    assert_eq!(head.number, 42);
    assert_eq!(head.chain_id, TEST_CHAIN_ID);
    assert_eq!(head.total_difficulty, Some(84));

    let block = h.pool.block_by_number(BlockRef::Number(42), false).await.unwrap().unwrap();
    assert_eq!(block["transactions"].as_array().map(Vec::len), Some(2));

    endpoint.respond("eth_getTransactionReceipt", Ok(create_test_receipt(42, 0)));
    let receipt = h.pool.transaction_receipt("0xabc").await.unwrap().unwrap();
    assert_eq!(receipt["status"], json!("0x1"));

    let labels = [
        ("chain_id", TEST_CHAIN_ID.to_string()),
        ("node", "a".to_string()),
        ("method", "eth_blockNumber".to_string()),
    ];
    assert_eq!(h.sink.observations(CALL_TIME_SECONDS, &labels).len(), 1);

    h.pool.close().await;
}

#[tokio::test]
async fn test_rpc_errors_surface_as_node_errors() {
    let h = Harness::new(fast_pool_config(SelectionMode::HighestHead), &["a"], &[]);
    h.primaries[0].respond_error("eth_estimateGas", "execution reverted");
    h.dial_and_settle().await;

    let err = h.pool.estimate_gas(json!({"to": "0x01"})).await.unwrap_err();
    assert_eq!(err.to_string(), "execution reverted");
    assert_eq!(err.as_str(), "rpc_error");
    assert!(err.node_error().is_some());

    h.pool.close().await;
}

#[tokio::test]
async fn test_no_live_nodes_error() {
    let (logs, _guard) = LogCapture::install();
    let h = Harness::new(fast_pool_config(SelectionMode::RoundRobin), &["a"], &[]);
    h.primaries[0].set_reachable(false);
    h.pool.dial().await.unwrap();

    let err = h.pool.block_number().await.unwrap_err();
    assert_eq!(err, PoolError::NoLiveNodes { chain_id: TEST_CHAIN_ID });
    assert_eq!(err.to_string(), format!("no live nodes for chain {TEST_CHAIN_ID}"));
    assert!(logs.contains("No live RPC nodes available"));

    h.pool.close().await;
}

#[tokio::test]
async fn test_dial_is_idempotent() {
    let h = Harness::new(fast_pool_config(SelectionMode::HighestHead), &["a", "b"], &[]);
    h.dial_and_settle().await;
    let dials: Vec<usize> = h.primaries.iter().map(|e| e.dials()).collect();

    h.pool.dial().await.unwrap();
    assert_eq!(dials, h.primaries.iter().map(|e| e.dials()).collect::<Vec<_>>());

    h.pool.close().await;
    assert_eq!(h.pool.dial().await.unwrap_err(), PoolError::Stopped);
}

#[tokio::test]
async fn test_send_only_start_failure_aborts_dial() {
    let h = Harness::new(fast_pool_config(SelectionMode::HighestHead), &["a"], &["relay"]);
    h.send_only[0].set_reachable(false);

    let err = h.pool.dial().await.unwrap_err();
    assert!(matches!(err, PoolError::SendOnlyStart { ref name, .. } if name == "relay"));
    assert_eq!(h.pool.nodes()[0].state(), NodeState::Closed);
    assert_eq!(h.pool.send_only_nodes()[0].state(), NodeState::Closed);
}

#[tokio::test]
async fn test_node_with_foreign_chain_id_is_rejected() {
    let endpoint = MockEndpoint::new("a", 5);
    let pool = PoolBuilder::new(fast_pool_config(SelectionMode::HighestHead))
        .node(NodeSpec::primary("a", endpoint.connector()).chain_id(5))
        .build()
        .unwrap();

    let err = pool.dial().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!(
            "node a has configured chain ID 5 which does not match pool configured chain ID of {TEST_CHAIN_ID}"
        )
    );
    assert_eq!(endpoint.dials(), 0);
}

#[tokio::test]
async fn test_highest_head_follows_heads() {
    let config = PoolConfig {
        no_new_heads_threshold_ms: 60_000,
        ..fast_pool_config(SelectionMode::HighestHead)
    };
    let h = Harness::new(config, &["a", "b", "c"], &[]);
    h.dial_and_settle().await;
    assert!(wait_for(SETTLE, || h.primaries.iter().all(|e| e.open_subscriptions() == 1)).await);

    h.primaries[0].push_head(5);
    h.primaries[1].push_head(5);
    h.primaries[2].push_head(7);
    let c = Arc::clone(&h.pool.nodes()[2]);
    assert!(wait_for(SETTLE, || c.chain_info().block_number == 7).await);

    for _ in 0..5 {
        assert_eq!(h.pool.select_node().unwrap().name(), "c");
    }
    let (live, best) = h.pool.latest_chain_info();
    assert_eq!(live, 3);
    assert_eq!(best.block_number, 7);

    h.pool.close().await;
}

#[tokio::test]
async fn test_lease_switches_to_better_node() {
    let (logs, _guard) = LogCapture::install();
    let config = PoolConfig {
        lease_duration_ms: 50,
        no_new_heads_threshold_ms: 60_000,
        ..fast_pool_config(SelectionMode::HighestHead)
    };
    let h = Harness::new(config, &["a", "b"], &[]);
    h.dial_and_settle().await;
    assert!(wait_for(SETTLE, || h.primaries.iter().all(|e| e.open_subscriptions() == 1)).await);

    // Both nodes are at -1; the tie goes to the lower order.
    let user_sub = h.pool.subscribe_new_heads().await.unwrap();
    assert_eq!(h.primaries[0].open_subscriptions(), 2);

    h.primaries[0].push_head(5);
    h.primaries[1].push_head(10);

    assert!(wait_for(SETTLE, || logs.contains(r#"Switching to best node from "a" to "b""#)).await);
    assert_eq!(h.pool.select_node().unwrap().name(), "b");
    assert!(user_sub.handle().is_stopped());
    assert!(wait_for(SETTLE, || h.primaries[0].open_subscriptions() == 1).await);
    assert_eq!(h.pool.nodes()[0].state(), NodeState::Alive);

    h.pool.close().await;
}

#[tokio::test]
async fn test_disabled_lease_is_logged() {
    let (logs, _guard) = LogCapture::install();
    let h = Harness::new(fast_pool_config(SelectionMode::RoundRobin), &["a"], &[]);
    h.dial_and_settle().await;
    assert!(logs.contains("Best node switching is disabled"));
    h.pool.close().await;
}

#[tokio::test]
async fn test_round_robin_spreads_reads() {
    let h = Harness::new(fast_pool_config(SelectionMode::RoundRobin), &["a", "b", "c"], &[]);
    h.dial_and_settle().await;

    for _ in 0..6 {
        h.pool.block_number().await.unwrap();
    }
    for endpoint in &h.primaries {
        assert_eq!(endpoint.calls("eth_blockNumber"), 2, "{}", endpoint.name());
    }

    h.pool.close().await;
}

#[tokio::test]
async fn test_sweep_reports_dead_nodes() {
    let (logs, _guard) = LogCapture::install();
    let h = Harness::new(fast_pool_config(SelectionMode::HighestHead), &["up", "down"], &["relay"]);
    h.primaries[1].set_reachable(false);
    h.pool.dial().await.unwrap();

    assert!(
        wait_for(SETTLE, || logs.contains("At least one primary node is dead: 1/2 nodes are alive"))
            .await
    );
    let gauge = h.sink.gauge(POOL_LIVE_NODES, &[("chain_id", TEST_CHAIN_ID.to_string())]);
    assert_eq!(gauge, Some(1.0));
    assert!(h.pool.healthy().is_ok());

    let states = h.pool.node_states();
    assert_eq!(states["up"], "Alive");
    assert_eq!(states["down"], "Unreachable");
    assert!(states.contains_key("relay"));

    h.pool.close().await;
}

#[tokio::test]
async fn test_healthy_fails_without_alive_primaries() {
    let h = Harness::new(fast_pool_config(SelectionMode::HighestHead), &["a", "b"], &[]);
    for endpoint in &h.primaries {
        endpoint.set_reachable(false);
    }
    h.pool.dial().await.unwrap();
    let node = Arc::clone(&h.pool.nodes()[0]);
    assert!(wait_for_state(&node, NodeState::Unreachable, SETTLE).await);

    let err = h.pool.healthy().unwrap_err();
    assert_eq!(err.to_string(), "no primary nodes available: 0/2 nodes are alive");

    h.pool.close().await;
}

#[tokio::test]
async fn test_batch_runs_on_every_alive_endpoint() {
    let (logs, _guard) = LogCapture::install();
    let h = Harness::new(fast_pool_config(SelectionMode::HighestHead), &["a", "b"], &["relay"]);
    h.dial_and_settle().await;

    let mut batch = vec![
        BatchElem::new("eth_blockNumber", json!([])),
        BatchElem::new("eth_getCode", json!(["0x01", "latest"])),
    ];
    h.pool.batch_call_context_all(&mut batch).await.unwrap();

    assert_eq!(batch[0].result, Some(json!("0x10")));
    assert!(batch[1].error.is_some());
    assert_eq!(h.primaries[0].calls("eth_blockNumber"), 1);
    assert_eq!(h.primaries[1].calls("eth_blockNumber"), 1);
    assert_eq!(h.send_only[0].calls("eth_blockNumber"), 1);
    assert!(!logs.contains("Secondary node BatchCallContext failed"));

    h.pool.close().await;
}

#[tokio::test]
async fn test_user_subscription_receives_stamped_heads() {
    let config = PoolConfig {
        no_new_heads_threshold_ms: 60_000,
        ..fast_pool_config(SelectionMode::HighestHead)
    };
    let h = Harness::new(config, &["a"], &[]);
    h.dial_and_settle().await;

    let mut sub = h.pool.subscribe_new_heads().await.unwrap();
    h.primaries[0].push_head(12);
    let head = tokio::time::timeout(SETTLE, sub.recv()).await.unwrap().unwrap();
    assert_eq!(head.number, 12);
    assert_eq!(head.chain_id, TEST_CHAIN_ID);
    assert_eq!(head.hash, head_json(12, None)["hash"].as_str().map(str::to_owned));

    h.primaries[0].fail_subscriptions("connection reset");
    let err = tokio::time::timeout(SETTLE, sub.recv_error()).await.unwrap().unwrap();
    assert!(err.to_string().starts_with("primary websocket (mock://a)"));

    h.pool.close().await;
}
