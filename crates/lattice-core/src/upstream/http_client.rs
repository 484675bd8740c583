use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, ClientBuilder};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{errors::NodeError, transport::RpcTransport};
use crate::types::{BatchElem, JsonRpcRequest, JsonRpcResponse};

/// Methods that must never be replayed by the HTTP retry loop.
const NON_IDEMPOTENT_METHODS: &[&str] = &["eth_sendRawTransaction", "eth_sendTransaction"];

/// Configuration for HTTP client concurrency and retry behavior.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum number of concurrent HTTP requests across all secondary transports
    pub concurrent_limit: usize,
    /// How long a request may wait for a concurrency permit
    pub permit_timeout: Duration,
    pub connect_timeout: Duration,
    /// Retries for idempotent requests on 5xx or connection errors
    pub max_retries: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            concurrent_limit: 512,
            permit_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            max_retries: 2,
        }
    }
}

/// HTTP client shared by every secondary transport of a pool.
///
/// Limits in-flight requests with a semaphore and retries idempotent requests on
/// transient failures.
pub struct HttpClient {
    client: Client,
    permits: Arc<Semaphore>,
    config: HttpClientConfig,
}

/// Keeps a concurrency permit for the lifetime of one request.
struct PermitGuard {
    _permit: OwnedSemaphorePermit,
}

impl HttpClient {
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn new() -> Result<Self, NodeError> {
        Self::with_config(HttpClientConfig::default())
    }

    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn with_config(config: HttpClientConfig) -> Result<Self, NodeError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .connect_timeout(config.connect_timeout)
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("lattice/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                NodeError::ConnectionFailed(format!("HTTP client build failed: {e}"))
            })?;

        Ok(Self { client, permits: Arc::new(Semaphore::new(config.concurrent_limit)), config })
    }

    /// Maps reqwest failures to short messages that never echo URLs or credentials.
    fn sanitize_network_error(error: &reqwest::Error) -> String {
        if error.is_connect() {
            "connection refused or unreachable".to_string()
        } else if error.is_timeout() {
            "connection timed out".to_string()
        } else if error.is_body() {
            "response body error".to_string()
        } else if error.is_decode() {
            "response decode error".to_string()
        } else if error.is_request() {
            "request failed".to_string()
        } else {
            "network error".to_string()
        }
    }

    async fn acquire(&self, url: &str) -> Result<PermitGuard, NodeError> {
        let permit =
            tokio::time::timeout(self.config.permit_timeout, Arc::clone(&self.permits).acquire_owned())
                .await
                .map_err(|_| {
                    tracing::warn!(
                        url,
                        available_permits = self.permits.available_permits(),
                        "http client permit acquisition timed out"
                    );
                    NodeError::Timeout
                })?
                .map_err(|_| NodeError::Closed)?;
        Ok(PermitGuard { _permit: permit })
    }

    /// POSTs `body` to `url` and returns the raw response body.
    ///
    /// # Errors
    ///
    /// - [`NodeError::Timeout`] if permit acquisition or the request times out
    /// - [`NodeError::HttpError`] for non-success HTTP status codes
    /// - [`NodeError::ConnectionFailed`] for network failures
    pub async fn send_request(
        &self,
        url: &str,
        body: Bytes,
        timeout: Duration,
        idempotent: bool,
    ) -> Result<Bytes, NodeError> {
        let _permit = self.acquire(url).await?;
        let max_retries = if idempotent { self.config.max_retries } else { 0 };
        let mut retries = 0;

        loop {
            let result = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .body(body.clone())
                .timeout(timeout)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    return response.bytes().await.map_err(|e| {
                        NodeError::ConnectionFailed(Self::sanitize_network_error(&e))
                    });
                }
                Ok(response) if response.status().is_server_error() && retries < max_retries => {
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(100 * (1 << retries))).await;
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let mut text = response.text().await.unwrap_or_default();
                    if text.len() > 256 {
                        let mut cut = 256;
                        while !text.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        text.truncate(cut);
                        text.push_str("... (truncated)");
                    }
                    return Err(NodeError::HttpError(status, text));
                }
                Err(e) if e.is_timeout() => return Err(NodeError::Timeout),
                Err(_) if retries < max_retries => {
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(100 * (1 << retries))).await;
                }
                Err(e) => return Err(NodeError::ConnectionFailed(Self::sanitize_network_error(&e))),
            }
        }
    }

    #[cfg(test)]
    fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Unary JSON-RPC transport over HTTP.
pub struct HttpTransport {
    client: Arc<HttpClient>,
    url: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl HttpTransport {
    #[must_use]
    pub fn new(client: Arc<HttpClient>, url: &str, timeout: Duration) -> Self {
        Self { client, url: url.to_string(), timeout, next_id: AtomicU64::new(1) }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn post<T: serde::Serialize>(&self, payload: &T, idempotent: bool) -> Result<Bytes, NodeError> {
        let body = serde_json::to_vec(payload).map_err(|e| NodeError::InvalidResponse(e.to_string()))?;
        self.client.send_request(&self.url, Bytes::from(body), self.timeout, idempotent).await
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, NodeError> {
    serde_json::from_slice(body).map_err(|e| NodeError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        let request = JsonRpcRequest::new(method, params, self.next_id());
        let body = self.post(&request, !NON_IDEMPOTENT_METHODS.contains(&method)).await?;
        decode::<JsonRpcResponse>(&body)?.into_result()
    }

    async fn batch_call(&self, batch: &mut [BatchElem]) -> Result<(), NodeError> {
        if batch.is_empty() {
            return Ok(());
        }
        let first_id = self.next_id.fetch_add(batch.len() as u64, Ordering::Relaxed);
        let requests: Vec<JsonRpcRequest> = batch
            .iter()
            .zip(first_id..)
            .map(|(elem, id)| JsonRpcRequest::new(elem.method.clone(), elem.params.clone(), id))
            .collect();
        let idempotent = batch.iter().all(|e| !NON_IDEMPOTENT_METHODS.contains(&e.method.as_str()));
        let body = self.post(&requests, idempotent).await?;
        let responses: Vec<JsonRpcResponse> = decode(&body)?;

        for response in responses {
            let Some(index) = response
                .id
                .as_u64()
                .and_then(|id| id.checked_sub(first_id))
                .and_then(|offset| usize::try_from(offset).ok())
                .filter(|i| *i < batch.len())
            else {
                continue;
            };
            match response.into_result() {
                Ok(value) => batch[index].result = Some(value),
                Err(e) => batch[index].error = Some(e),
            }
        }
        for elem in batch.iter_mut().filter(|e| e.result.is_none() && e.error.is_none()) {
            elem.error = Some(NodeError::InvalidResponse("missing response in batch".into()));
        }
        Ok(())
    }

    fn uri(&self) -> &str {
        &self.url
    }

    fn close(&self) {}
}
