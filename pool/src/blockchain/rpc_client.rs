/// Daemon RPC client
///
/// JSON-RPC over HTTP against a CryptoNote daemon, guarded by a circuit
/// breaker so a dead daemon does not stall every polling tick on timeouts.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Buf, Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::DaemonConfig;
use crate::metrics::prometheus as metrics;

/// Template as returned by `getblocktemplate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawTemplate {
    pub blocktemplate_blob: String,
    pub difficulty: u64,
    pub height: u64,
    pub reserved_offset: usize,
    #[serde(default)]
    pub seed_hash: String,
    #[serde(default)]
    pub prev_hash: String,
}

/// Everything the pool asks of the daemon.
#[async_trait]
pub trait DaemonRpc: Send + Sync {
    async fn get_block_template(&self, reserve_size: u32, wallet_address: &str) -> Result<RawTemplate>;

    /// Current chain length; equals the height of the next block.
    async fn get_block_count(&self) -> Result<u64>;

    async fn get_block_hash(&self, height: u64) -> Result<String>;

    async fn submit_block(&self, blob_hex: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());

        if self.failures >= self.max_failures && !self.is_open {
            self.is_open = true;
            tracing::error!(
                "Daemon circuit breaker tripped after {} failures, pausing RPC for {}s",
                self.failures,
                self.reset_timeout.as_secs()
            );
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!("Daemon circuit breaker reset");
        }
    }

    fn check(&mut self) -> Result<()> {
        if self.is_open {
            match self.last_failure {
                Some(last) if last.elapsed() <= self.reset_timeout => {
                    return Err(anyhow!("daemon RPC circuit breaker is open"));
                }
                _ => {
                    tracing::info!("Daemon circuit breaker half-open, retrying");
                    self.is_open = false;
                    self.failures = 0;
                }
            }
        }
        Ok(())
    }
}

pub struct DaemonClient {
    base_url: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    circuit_breaker: Arc<RwLock<CircuitBreaker>>,
}

impl DaemonClient {
    pub fn new(cfg: &DaemonConfig) -> Self {
        let base_url = format!("http://{}:{}{}", cfg.host, cfg.port, cfg.path);
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        tracing::info!("Daemon RPC client initialized: {}", base_url);

        Self {
            base_url,
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
            client,
            circuit_breaker: Arc::new(RwLock::new(CircuitBreaker::new())),
        }
    }

    /// Make a JSON-RPC call; a JSON-RPC level error is returned as `Err`
    /// without counting against the breaker.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        metrics::inc_rpc_requests();

        let res = self.call_inner(method, params).await;
        if res.is_err() {
            metrics::inc_rpc_errors();
        }
        res
    }

    async fn call_inner(&self, method: &str, params: Value) -> Result<Value> {
        self.circuit_breaker.write().await.check()?;

        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: 0,
            method: method.to_string(),
            params,
        };
        let body = Full::new(Bytes::from(serde_json::to_vec(&payload)?));

        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.base_url)
            .header("Content-Type", "application/json")
            .body(body)?;

        let transport: Result<Bytes> = async {
            let response = tokio::time::timeout(self.timeout, self.client.request(req))
                .await
                .map_err(|_| anyhow!("daemon RPC timeout calling {}", method))?
                .map_err(|e| anyhow!("daemon connection failed: {}", e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(anyhow!("daemon HTTP error: {}", status));
            }
            let bytes = response.into_body().collect().await?.to_bytes();
            Ok(bytes)
        }
        .await;

        let bytes = match transport {
            Ok(bytes) => bytes,
            Err(e) => {
                self.circuit_breaker.write().await.record_failure();
                return Err(e);
            }
        };
        self.circuit_breaker.write().await.record_success();

        let rpc_response: RpcResponse = serde_json::from_reader(bytes.reader())?;
        if let Some(error) = rpc_response.error {
            return Err(anyhow!("daemon RPC error from {}: {}", method, error));
        }
        Ok(rpc_response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl DaemonRpc for DaemonClient {
    async fn get_block_template(&self, reserve_size: u32, wallet_address: &str) -> Result<RawTemplate> {
        let result = self
            .call(
                "getblocktemplate",
                json!({ "reserve_size": reserve_size, "wallet_address": wallet_address }),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn get_block_count(&self) -> Result<u64> {
        let result = self.call("getblockcount", Value::Null).await?;
        result
            .get("count")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow!("getblockcount returned no count: {}", result))
    }

    async fn get_block_hash(&self, height: u64) -> Result<String> {
        let result = self.call("on_getblockhash", json!([height])).await?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("on_getblockhash returned non-string: {}", result))
    }

    async fn submit_block(&self, blob_hex: &str) -> Result<()> {
        let result = self.call("submitblock", json!([blob_hex])).await?;
        match result.get("status").and_then(|s| s.as_str()) {
            Some(status) if status.eq_ignore_ascii_case("ok") => Ok(()),
            _ => Err(anyhow!("submitblock rejected: {}", result)),
        }
    }
}
