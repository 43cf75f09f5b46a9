//! JSON-RPC over HTTP transport for EVM nodes.
//!
//! One `HttpEndpoint` per pool entry. Timeouts are enforced both by the
//! reqwest client and by the quorum client's per-request deadline.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256, U64};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{EndpointError, LedgerEndpoint, ReceiptSummary};
use crate::types::Endpoint;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: H256,
    #[serde(default)]
    block_number: Option<U64>,
    #[serde(default)]
    block_hash: Option<H256>,
    #[serde(default)]
    status: Option<U64>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A single EVM node reached over HTTP JSON-RPC.
pub struct HttpEndpoint {
    endpoint: Endpoint,
    http: Client,
    next_id: AtomicU64,
}

impl HttpEndpoint {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("quorum-settler/0.1.0")
            .build()
            .with_context(|| format!("Failed to build HTTP client for {}", endpoint.url))?;

        Ok(Self {
            endpoint,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// Issue one JSON-RPC call. `Ok(None)` means the node returned `null`.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, EndpointError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        debug!(url = %self.endpoint.url, method, "JSON-RPC call");

        let resp = self
            .http
            .post(&self.endpoint.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EndpointError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EndpointError::Transport(format!("HTTP {status}: {body}")));
        }

        let body: RpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| EndpointError::Decode(e.to_string()))?;

        if let Some(err) = body.error {
            return Err(EndpointError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        Ok(body.result)
    }

    /// Like `call`, but a `null` result is a protocol violation.
    async fn call_required<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, EndpointError> {
        self.call(method, params)
            .await?
            .ok_or_else(|| EndpointError::Decode(format!("{method} returned null")))
    }
}

#[async_trait]
impl LedgerEndpoint for HttpEndpoint {
    async fn block_number(&self) -> Result<u64, EndpointError> {
        let height: U64 = self.call_required("eth_blockNumber", json!([])).await?;
        Ok(height.as_u64())
    }

    async fn balance(&self, address: Address) -> Result<U256, EndpointError> {
        self.call_required("eth_getBalance", json!([address, "latest"]))
            .await
    }

    async fn gas_price(&self) -> Result<U256, EndpointError> {
        self.call_required("eth_gasPrice", json!([])).await
    }

    async fn transaction_count(&self, address: Address) -> Result<U256, EndpointError> {
        self.call_required("eth_getTransactionCount", json!([address, "pending"]))
            .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, EndpointError> {
        self.call_required("eth_sendRawTransaction", json!([raw]))
            .await
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<ReceiptSummary>, EndpointError> {
        let receipt: Option<RpcReceipt> =
            self.call("eth_getTransactionReceipt", json!([hash])).await?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };

        // Some nodes return a receipt shell before the block is sealed.
        match (receipt.block_number, receipt.block_hash) {
            (Some(number), Some(block_hash)) => Ok(Some(ReceiptSummary {
                transaction_hash: receipt.transaction_hash,
                block_number: number.as_u64(),
                block_hash,
                status: receipt.status.map(|s| s.as_u64()).unwrap_or(1),
            })),
            _ => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
