//! Ledger endpoint access.
//!
//! Defines the `LedgerEndpoint` trait implemented by each remote node
//! transport, plus the quorum client that aggregates a pool of them.

pub mod http;
pub mod quorum;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};

/// Failure talking to a single endpoint.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EndpointError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// The node answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl EndpointError {
    /// Whether the node itself answered (as opposed to being unreachable).
    pub fn is_response(&self) -> bool {
        matches!(self, EndpointError::Rpc { .. })
    }
}

/// The subset of a transaction receipt the settlement pipeline needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptSummary {
    pub transaction_hash: H256,
    pub block_number: u64,
    pub block_hash: H256,
    /// 1 = success, 0 = reverted.
    pub status: u64,
}

/// Abstraction over one remote ledger node.
///
/// Implementors answer a single read or submission each; agreement across
/// nodes is the quorum client's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerEndpoint: Send + Sync {
    /// Current chain height.
    async fn block_number(&self) -> Result<u64, EndpointError>;

    /// Balance of `address` in wei at the latest block.
    async fn balance(&self, address: Address) -> Result<U256, EndpointError>;

    /// Current gas price in wei.
    async fn gas_price(&self) -> Result<U256, EndpointError>;

    /// Pending transaction count (next nonce) for `address`.
    async fn transaction_count(&self, address: Address) -> Result<U256, EndpointError>;

    /// Broadcast a signed, RLP-encoded transaction.
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, EndpointError>;

    /// Receipt for `hash`, or `None` while still pending.
    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<ReceiptSummary>, EndpointError>;
}
