//! Monitor loops, one per non-terminal node state.
//!
//! Every loop owns the per-state token it was spawned with and returns as soon as that
//! token is cancelled. Transitions a loop requests go through
//! [`Node::transition_owned`], so they are dropped once the node has moved on.

use std::{pin::Pin, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    time::{interval_at, Instant, Interval, MissedTickBehavior, Sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    backoff::Backoff,
    node::{Node, Verification},
    node_state::NodeState,
};
use crate::types::Head;

const DEGRADED: &str = "but cannot disable this connection because there are no other RPC \
                        endpoints, or all other RPC endpoints are dead.";
const URGENT: &str = "RPC endpoint is operating in a degraded state and urgent action is \
                      required to resolve the issue";

/// What an out-of-sync node has to show before it is considered live again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCheck {
    /// A head strictly newer than the recorded block number.
    NewerThan(i64),
    /// A head within the pool's sync threshold.
    WithinThreshold,
}

impl SyncCheck {
    fn is_in_sync(self, node: &Node, head: &Head) -> bool {
        match self {
            Self::NewerThan(recorded) => head.number > recorded,
            Self::WithinThreshold => !node.sync_status(head.number, head.total_difficulty).0,
        }
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_opt(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

fn rearm(sleep: &mut Option<Pin<Box<Sleep>>>, after: Duration) {
    if let Some(sleep) = sleep {
        sleep.as_mut().reset(Instant::now() + after);
    }
}

/// Watches a live node: head subscription, liveness polling and sync checks.
pub(crate) async fn alive_loop(node: Arc<Node>, token: CancellationToken) {
    let settings = node.settings().clone();
    let no_new_heads = settings.no_new_heads_threshold;
    let poll_interval = settings.poll_interval;
    let poll_threshold = settings.poll_failure_threshold;
    debug!(node = %node.name(), "alive loop starting");

    let (mut heads, mut sub_errors) = (None, None);
    if !no_new_heads.is_zero() {
        match node.subscribe_heads_owned(&token, true).await {
            Ok(sub) => {
                let (items, errors, _handle) = sub.into_parts();
                heads = Some(items);
                sub_errors = Some(errors);
            }
            Err(e) => {
                if token.is_cancelled() {
                    return;
                }
                error!(node = %node.name(), error = %e, "Initial subscribe for heads failed");
                node.transition_owned(&token, NodeState::Unreachable);
                return;
            }
        }
    }

    let mut poll = (poll_threshold > 0 && !poll_interval.is_zero()).then(|| {
        let mut interval = interval_at(Instant::now() + poll_interval, poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut stall: Option<Pin<Box<Sleep>>> =
        (!no_new_heads.is_zero()).then(|| Box::pin(tokio::time::sleep(no_new_heads)));
    let mut highest = node.chain_info().block_number;
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => return,
            err = recv_opt(&mut sub_errors) => {
                match err {
                    Some(e) => error!(node = %node.name(), error = %e, "Subscription was terminated"),
                    None => error!(node = %node.name(), "Subscription channel unexpectedly closed"),
                }
                node.transition_owned(&token, NodeState::Unreachable);
                return;
            }
            head = recv_opt(&mut heads) => {
                let Some(head) = head else {
                    error!(node = %node.name(), "Subscription channel unexpectedly closed");
                    node.transition_owned(&token, NodeState::Unreachable);
                    return;
                };
                node.record_head(&head);
                if head.number > highest {
                    highest = head.number;
                    rearm(&mut stall, no_new_heads);
                }
            }
            () = tick_opt(&mut poll) => {
                match node.poll_client_version(&token, poll_interval).await {
                    Ok(version) => {
                        debug!(node = %node.name(), version = %version, "Version poll successful");
                        failures = 0;
                    }
                    Err(e) => {
                        if token.is_cancelled() {
                            return;
                        }
                        failures += 1;
                        warn!(
                            node = %node.name(),
                            error = %e,
                            failures,
                            "Poll failure, RPC endpoint {} failed to respond properly",
                            node.name()
                        );
                    }
                }

                if failures > 0 && failures >= poll_threshold {
                    if node.live_count() < 2 {
                        error!(
                            node = %node.name(),
                            "RPC endpoint failed to respond to {failures} consecutive polls; {DEGRADED} {URGENT}"
                        );
                        continue;
                    }
                    error!(
                        node = %node.name(),
                        "RPC endpoint failed to respond to {failures} consecutive polls"
                    );
                    node.transition_owned(&token, NodeState::Unreachable);
                    return;
                }

                if failures == 0 {
                    let info = node.chain_info();
                    let (out_of_sync, live) = node.sync_status(info.block_number, info.total_difficulty);
                    if out_of_sync {
                        if live < 2 {
                            error!(node = %node.name(), "RPC endpoint has fallen behind; {DEGRADED} {URGENT}");
                        } else {
                            error!(node = %node.name(), block = info.block_number, "RPC endpoint has fallen behind");
                            node.declare_out_of_sync(&token, SyncCheck::WithinThreshold);
                            return;
                        }
                    }
                }
            }
            () = sleep_opt(&mut stall) => {
                if node.live_count() < 2 {
                    error!(
                        node = %node.name(),
                        threshold = ?no_new_heads,
                        "RPC endpoint detected out of sync; {DEGRADED} {URGENT}"
                    );
                    rearm(&mut stall, no_new_heads / 2);
                    continue;
                }
                error!(
                    node = %node.name(),
                    threshold = ?no_new_heads,
                    "RPC endpoint detected out of sync; no new heads received"
                );
                node.declare_out_of_sync(&token, SyncCheck::NewerThan(highest));
                return;
            }
        }
    }
}

/// Redials an out-of-sync node and waits for it to catch up.
pub(crate) async fn out_of_sync_loop(node: Arc<Node>, token: CancellationToken, check: SyncCheck) {
    let no_new_heads = node.settings().no_new_heads_threshold;
    info!(node = %node.name(), ?check, "RPC node is out of sync");

    if let Err(e) = node.redial(&token).await {
        if !token.is_cancelled() {
            error!(node = %node.name(), error = %e, "Failed to dial out-of-sync RPC node");
            node.transition_owned(&token, NodeState::Unreachable);
        }
        return;
    }

    match node.verify_chain_id(&token).await {
        Verification::Verified => {}
        Verification::Mismatch { actual } => {
            error!(node = %node.name(), actual, "out-of-sync RPC node has the wrong chain id");
            node.transition_owned(&token, NodeState::InvalidChainId);
            return;
        }
        Verification::Failed(e) => {
            if !token.is_cancelled() {
                error!(node = %node.name(), error = %e, "failed to verify out-of-sync RPC node");
                node.transition_owned(&token, NodeState::InvalidChainId);
            }
            return;
        }
    }

    let sub = match node.subscribe_heads_owned(&token, false).await {
        Ok(sub) => sub,
        Err(e) => {
            if !token.is_cancelled() {
                error!(node = %node.name(), error = %e, "failed to subscribe heads on out-of-sync RPC node");
                node.transition_owned(&token, NodeState::Unreachable);
            }
            return;
        }
    };
    let (mut heads, mut errors, _handle) = sub.into_parts();
    let mut deadline: Option<Pin<Box<Sleep>>> =
        (!no_new_heads.is_zero()).then(|| Box::pin(tokio::time::sleep(no_new_heads)));

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => return,
            err = errors.recv() => {
                match err {
                    Some(e) => error!(node = %node.name(), error = %e, "Subscription was terminated"),
                    None => error!(node = %node.name(), "Subscription channel unexpectedly closed"),
                }
                node.transition_owned(&token, NodeState::Unreachable);
                return;
            }
            head = heads.recv() => {
                let Some(head) = head else {
                    error!(node = %node.name(), "Subscription channel unexpectedly closed");
                    node.transition_owned(&token, NodeState::Unreachable);
                    return;
                };
                node.record_head(&head);
                if check.is_in_sync(&node, &head) {
                    info!(node = %node.name(), block = head.number, "RPC node back in sync");
                    node.transition_owned(&token, NodeState::Alive);
                    return;
                }
                debug!(
                    node = %node.name(),
                    block = head.number,
                    "Received block for RPC node, waiting until back in-sync to mark as live again"
                );
            }
            () = sleep_opt(&mut deadline) => {
                if node.live_count() < 1 {
                    error!(
                        node = %node.name(),
                        "RPC endpoint is still out of sync, but there are no other available nodes. \
                         This RPC node will be forcibly moved back into the live pool in a degraded state"
                    );
                    node.transition_owned(&token, NodeState::Alive);
                    return;
                }
                rearm(&mut deadline, no_new_heads);
            }
        }
    }
}

/// Redials with backoff until the node is reachable again. Never gives up.
pub(crate) async fn unreachable_loop(node: Arc<Node>, token: CancellationToken) {
    let mut backoff = Backoff::new(node.settings().backoff);
    debug!(node = %node.name(), "RPC node is unreachable");

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => return,
            () = tokio::time::sleep(backoff.next_delay()) => {}
        }

        if let Err(e) = node.redial(&token).await {
            if token.is_cancelled() {
                return;
            }
            warn!(
                node = %node.name(),
                error = %e,
                attempt = backoff.attempts(),
                "Failed to redial RPC node; still unreachable"
            );
            continue;
        }

        match node.verify_chain_id(&token).await {
            Verification::Verified => {
                info!(node = %node.name(), "RPC node is online");
                node.transition_owned(&token, NodeState::Alive);
            }
            Verification::Mismatch { actual } => {
                error!(node = %node.name(), actual, "redialed RPC node has the wrong chain id");
                node.transition_owned(&token, NodeState::InvalidChainId);
            }
            Verification::Failed(e) => {
                if token.is_cancelled() {
                    return;
                }
                error!(node = %node.name(), error = %e, "Failed to redial RPC node; verify failed");
                node.transition_owned(&token, NodeState::Unreachable);
            }
        }
        return;
    }
}

/// Re-verifies the chain ID with backoff until it matches.
pub(crate) async fn invalid_chain_id_loop(node: Arc<Node>, token: CancellationToken) {
    let mut backoff = Backoff::new(node.settings().backoff);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => return,
            () = tokio::time::sleep(backoff.next_delay()) => {}
        }

        match node.verify_chain_id(&token).await {
            Verification::Verified => {
                info!(node = %node.name(), "RPC node chain id verified");
                node.transition_owned(&token, NodeState::Alive);
                return;
            }
            Verification::Mismatch { actual } => {
                warn!(
                    node = %node.name(),
                    expected = node.configured_chain_id(),
                    actual,
                    "Failed to verify RPC node; remote endpoint returned the wrong chain ID"
                );
            }
            Verification::Failed(e) => {
                if token.is_cancelled() {
                    return;
                }
                error!(node = %node.name(), error = %e, "Unexpected error while verifying RPC node chain ID");
                node.transition_owned(&token, NodeState::Unreachable);
                return;
            }
        }
    }
}
