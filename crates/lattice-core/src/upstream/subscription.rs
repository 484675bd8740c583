//! Push subscriptions and the forwarder that relays them.
//!
//! A [`Subscription`] is a pair of channels (items and errors) plus a
//! [`SubscriptionHandle`] that stops the task feeding them. `unsubscribe` is synchronous
//! in the sense that matters: it returns only after the feeding task has exited, so no
//! value is delivered after it completes.

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::errors::NodeError;

/// Buffer size for forwarded item channels.
pub const ITEM_CHANNEL_CAPACITY: usize = 64;

/// Stop/exit pair shared between a subscription's owner and its feeding task.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    stop: CancellationToken,
    exited: CancellationToken,
}

/// Held by the feeding task; marks the subscription as exited when dropped.
#[derive(Debug)]
pub struct ExitGuard {
    _guard: DropGuard,
}

impl SubscriptionHandle {
    /// Creates a handle and the guard its feeding task must hold until it returns.
    #[must_use]
    pub fn new() -> (Self, ExitGuard) {
        let handle = Self { stop: CancellationToken::new(), exited: CancellationToken::new() };
        let guard = ExitGuard { _guard: handle.exited.clone().drop_guard() };
        (handle, guard)
    }

    /// Token the feeding task watches for a stop request.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Asks the feeding task to stop without waiting for it.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Stops the feeding task and waits until it has exited. Idempotent.
    pub async fn unsubscribe(&self) {
        self.stop.cancel();
        self.exited.cancelled().await;
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }
}

/// Live push subscription: items, at most one error, and the handle that stops it.
#[derive(Debug)]
pub struct Subscription<T> {
    items: mpsc::Receiver<T>,
    errors: mpsc::Receiver<NodeError>,
    handle: SubscriptionHandle,
}

impl<T> Subscription<T> {
    #[must_use]
    pub fn new(
        items: mpsc::Receiver<T>,
        errors: mpsc::Receiver<NodeError>,
        handle: SubscriptionHandle,
    ) -> Self {
        Self { items, errors, handle }
    }

    #[must_use]
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Next item, or `None` once the feeding task has exited.
    pub async fn recv(&mut self) -> Option<T> {
        self.items.recv().await
    }

    /// The subscription's error, or `None` once the error channel is closed.
    pub async fn recv_error(&mut self) -> Option<NodeError> {
        self.errors.recv().await
    }

    pub async fn unsubscribe(&self) {
        self.handle.unsubscribe().await;
    }

    #[must_use]
    pub fn into_parts(self) -> (mpsc::Receiver<T>, mpsc::Receiver<NodeError>, SubscriptionHandle) {
        (self.items, self.errors, self.handle)
    }
}

/// Relays `upstream` into a new subscription.
///
/// Items pass through `map_item` (returning `None` drops the item) and are sent on a
/// fresh channel; the send is raced against the stop signal so a slow consumer never
/// blocks `unsubscribe`. The first upstream error is passed through `map_err`, delivered
/// on the error channel, and ends forwarding. Stopping the returned subscription
/// unsubscribes `upstream` before the forwarding task exits.
pub fn forward<U, T, F, E>(upstream: Subscription<U>, map_item: F, map_err: E) -> Subscription<T>
where
    U: Send + 'static,
    T: Send + 'static,
    F: FnMut(U) -> Option<T> + Send + 'static,
    E: Fn(NodeError) -> NodeError + Send + 'static,
{
    let (item_tx, item_rx) = mpsc::channel(ITEM_CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(1);
    let (handle, guard) = SubscriptionHandle::new();
    tokio::spawn(run_forwarder(upstream, item_tx, err_tx, handle.stop_token(), guard, map_item, map_err));
    Subscription::new(item_rx, err_rx, handle)
}

async fn run_forwarder<U, T, F, E>(
    upstream: Subscription<U>,
    item_tx: mpsc::Sender<T>,
    err_tx: mpsc::Sender<NodeError>,
    stop: CancellationToken,
    _guard: ExitGuard,
    mut map_item: F,
    map_err: E,
) where
    F: FnMut(U) -> Option<T>,
    E: Fn(NodeError) -> NodeError,
{
    let (mut items, mut errors, upstream_handle) = upstream.into_parts();
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            err = errors.recv() => {
                if let Some(err) = err {
                    tokio::select! {
                        biased;
                        () = stop.cancelled() => {}
                        _ = err_tx.send(map_err(err)) => {}
                    }
                }
                break;
            }
            item = items.recv() => {
                let Some(item) = item else { break };
                let Some(mapped) = map_item(item) else { continue };
                tokio::select! {
                    biased;
                    () = stop.cancelled() => break,
                    sent = item_tx.send(mapped) => if sent.is_err() { break },
                }
            }
        }
    }
    // Downstream must observe disconnection by the time the exit guard drops.
    drop(item_tx);
    drop(err_tx);
    upstream_handle.unsubscribe().await;
}

/// Wraps `sub` so that every error it reports is prefixed with `prefix`.
pub fn prefix_errors<T>(sub: Subscription<T>, prefix: impl Into<String>) -> Subscription<T>
where
    T: Send + 'static,
{
    let prefix = prefix.into();
    let (items, mut errors, inner) = sub.into_parts();
    let (err_tx, err_rx) = mpsc::channel(1);
    let (handle, guard) = SubscriptionHandle::new();
    let stop = handle.stop_token();
    tokio::spawn(async move {
        let _guard = guard;
        tokio::select! {
            biased;
            () = stop.cancelled() => {}
            err = errors.recv() => {
                if let Some(err) = err {
                    let _ = err_tx.send(err.with_prefix(&prefix)).await;
                }
            }
        }
        drop(err_tx);
        inner.unsubscribe().await;
    });
    Subscription::new(items, err_rx, handle)
}
