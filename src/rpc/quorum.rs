//! Quorum client over a pool of redundant ledger endpoints.
//!
//! Reads fan out to every endpoint concurrently and only return a value
//! reported identically by at least `quorum` endpoints. Submissions are
//! broadcast to all endpoints and need a single acceptance.

use anyhow::{bail, Result};
use ethers::types::{Address, Bytes, H256, U256};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{EndpointError, LedgerEndpoint};
use crate::types::{Confirmation, Endpoint, FeeEstimate, SettlementError, TxHandle};

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// An endpoint descriptor paired with the transport that reaches it.
#[derive(Clone)]
pub struct PooledEndpoint {
    pub endpoint: Endpoint,
    pub node: Arc<dyn LedgerEndpoint>,
}

impl PooledEndpoint {
    pub fn new(endpoint: Endpoint, node: Arc<dyn LedgerEndpoint>) -> Self {
        Self { endpoint, node }
    }
}

/// Deadlines applied by the quorum client.
#[derive(Debug, Clone)]
pub struct QuorumSettings {
    /// Per-endpoint deadline for a single read or submission.
    pub request_timeout: Duration,
    /// Deadline for the connection probe.
    pub connect_timeout: Duration,
    /// Delay between receipt polls while awaiting confirmation.
    pub poll_interval: Duration,
}

impl Default for QuorumSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Agreement
// ---------------------------------------------------------------------------

/// Pick the value with the most identical answers, provided it reaches
/// `quorum`. Ties go to the value first reported in pool order.
///
/// Returns the best agreement count on failure.
pub fn tally<T: PartialEq + Clone>(answers: &[T], quorum: usize) -> Result<T, usize> {
    let mut votes: Vec<(&T, usize)> = Vec::new();
    for answer in answers {
        match votes.iter_mut().find(|entry| entry.0 == answer) {
            Some(entry) => entry.1 += 1,
            None => votes.push((answer, 1)),
        }
    }

    let mut best: Option<(&T, usize)> = None;
    for (value, count) in votes {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((value, count));
        }
    }

    match best {
        Some((value, count)) if count >= quorum => Ok(value.clone()),
        Some((_, count)) => Err(count),
        None => Err(0),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct QuorumClient {
    pool: Vec<PooledEndpoint>,
    quorum: usize,
    settings: QuorumSettings,
}

impl QuorumClient {
    /// Build a client. Fails on an empty pool, a quorum outside
    /// `1..=pool.len()`, or endpoints that disagree on chain id.
    pub fn new(pool: Vec<PooledEndpoint>, quorum: usize, settings: QuorumSettings) -> Result<Self> {
        if pool.is_empty() {
            bail!("Endpoint pool is empty");
        }
        if quorum == 0 || quorum > pool.len() {
            bail!(
                "Quorum {quorum} is outside 1..={} for this endpoint pool",
                pool.len()
            );
        }
        let chain_id = pool[0].endpoint.chain_id;
        if let Some(other) = pool.iter().find(|p| p.endpoint.chain_id != chain_id) {
            bail!(
                "Endpoint {} is on chain {}, expected {chain_id}",
                other.endpoint.url,
                other.endpoint.chain_id
            );
        }

        Ok(Self {
            pool,
            quorum,
            settings,
        })
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn chain_id(&self) -> u64 {
        self.pool[0].endpoint.chain_id
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.pool.iter().map(|p| &p.endpoint)
    }

    /// Run `op` against every endpoint concurrently, each bounded by
    /// `deadline`. Results come back in pool order.
    async fn fan_out<T, F, Fut>(&self, deadline: Duration, op: F) -> Vec<Result<T, EndpointError>>
    where
        F: Fn(Arc<dyn LedgerEndpoint>) -> Fut,
        Fut: Future<Output = Result<T, EndpointError>>,
    {
        let deadline_ms = deadline.as_millis() as u64;
        let calls = self.pool.iter().map(|p| {
            let call = op(Arc::clone(&p.node));
            async move {
                match tokio::time::timeout(deadline, call).await {
                    Ok(result) => result,
                    Err(_) => Err(EndpointError::Timeout(deadline_ms)),
                }
            }
        });
        join_all(calls).await
    }

    async fn quorum_read<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, SettlementError>
    where
        T: PartialEq + Clone + std::fmt::Debug,
        F: Fn(Arc<dyn LedgerEndpoint>) -> Fut,
        Fut: Future<Output = Result<T, EndpointError>>,
    {
        let results = self.fan_out(self.settings.request_timeout, op).await;

        let mut answers = Vec::with_capacity(results.len());
        let mut failures = 0usize;
        for (entry, result) in self.pool.iter().zip(results) {
            match result {
                Ok(value) => {
                    debug!(url = %entry.endpoint.url, operation, value = ?value, "Endpoint answered");
                    answers.push(value);
                }
                Err(e) => {
                    warn!(url = %entry.endpoint.url, operation, error = %e, "Endpoint read failed");
                    failures += 1;
                }
            }
        }

        if answers.is_empty() {
            return Err(SettlementError::ConnectionFailure(format!(
                "{operation}: none of {failures} endpoints answered"
            )));
        }

        tally(&answers, self.quorum).map_err(|best_agreement| {
            warn!(
                operation,
                required = self.quorum,
                best_agreement,
                responded = answers.len(),
                "Endpoints disagree"
            );
            SettlementError::NoQuorum {
                operation,
                required: self.quorum,
                best_agreement,
                responded: answers.len(),
            }
        })
    }

    /// Probe every endpoint for chain height. Succeeds with the highest
    /// reported height if at least one endpoint answers in time.
    pub async fn connect(&self) -> Result<u64, SettlementError> {
        let results = self
            .fan_out(self.settings.connect_timeout, |node| async move {
                node.block_number().await
            })
            .await;

        let mut live = 0usize;
        let mut height: Option<u64> = None;
        for (entry, result) in self.pool.iter().zip(results) {
            match result {
                Ok(h) => {
                    live += 1;
                    height = Some(height.map_or(h, |best| best.max(h)));
                    debug!(url = %entry.endpoint.url, height = h, "Endpoint reachable");
                }
                Err(e) => warn!(url = %entry.endpoint.url, error = %e, "Endpoint unreachable"),
            }
        }

        let Some(height) = height else {
            return Err(SettlementError::ConnectionFailure(format!(
                "none of {} endpoints answered eth_blockNumber",
                self.pool.len()
            )));
        };

        if live < self.quorum {
            warn!(live, quorum = self.quorum, "Fewer live endpoints than quorum; reads will fail");
        }
        info!(live, total = self.pool.len(), height, "Endpoint pool connected");
        Ok(height)
    }

    pub async fn get_balance(&self, address: Address) -> Result<U256, SettlementError> {
        self.quorum_read("balance", move |node| async move { node.balance(address).await })
            .await
    }

    pub async fn get_fee_estimate(&self) -> Result<FeeEstimate, SettlementError> {
        let gas_price = self
            .quorum_read("gas_price", |node| async move { node.gas_price().await })
            .await?;
        Ok(FeeEstimate { gas_price })
    }

    pub async fn get_nonce(&self, address: Address) -> Result<U256, SettlementError> {
        self.quorum_read("nonce", move |node| async move {
            node.transaction_count(address).await
        })
        .await
    }

    /// Broadcast a signed transaction to every endpoint.
    ///
    /// One acceptance is enough; a node that already holds the transaction
    /// counts as accepting it.
    pub async fn submit(&self, raw: Bytes, tx_hash: H256) -> Result<TxHandle, SettlementError> {
        let results = self
            .fan_out(self.settings.request_timeout, |node| {
                let raw = raw.clone();
                async move { node.send_raw_transaction(raw).await }
            })
            .await;

        let mut accepted_by = 0usize;
        let mut rejection: Option<String> = None;
        for (entry, result) in self.pool.iter().zip(results) {
            match result {
                Ok(hash) => {
                    if hash != tx_hash {
                        warn!(url = %entry.endpoint.url, returned = ?hash, expected = ?tx_hash, "Endpoint returned unexpected hash");
                    }
                    accepted_by += 1;
                }
                Err(EndpointError::Rpc { message, .. }) if is_already_known(&message) => {
                    accepted_by += 1;
                }
                Err(e) => {
                    warn!(url = %entry.endpoint.url, error = %e, "Broadcast failed");
                    if e.is_response() && rejection.is_none() {
                        rejection = Some(e.to_string());
                    }
                }
            }
        }

        if accepted_by > 0 {
            info!(tx_hash = ?tx_hash, accepted_by, "Transaction broadcast");
            return Ok(TxHandle {
                tx_hash,
                accepted_by,
            });
        }

        match rejection {
            Some(reason) => Err(SettlementError::SubmissionRejected(reason)),
            None => Err(SettlementError::ConnectionFailure(
                "no endpoint reachable for broadcast".to_string(),
            )),
        }
    }

    /// Poll for inclusion of `handle` until `timeout` elapses.
    pub async fn await_confirmation(
        &self,
        handle: &TxHandle,
        timeout: Duration,
    ) -> Result<Confirmation, SettlementError> {
        let tx_hash = handle.tx_hash;

        let poll = async {
            loop {
                let receipts = self
                    .fan_out(self.settings.request_timeout, |node| async move {
                        node.transaction_receipt(tx_hash).await
                    })
                    .await;

                let receipt = receipts
                    .into_iter()
                    .flatten()
                    .flatten()
                    .find(|r| r.transaction_hash == tx_hash);
                if let Some(receipt) = receipt {
                    if receipt.status == 1 {
                        return Ok(Confirmation {
                            tx_hash,
                            block_number: receipt.block_number,
                            block_hash: receipt.block_hash,
                        });
                    }
                    return Err(SettlementError::SubmissionRejected(format!(
                        "transaction {tx_hash:?} reverted in block {}",
                        receipt.block_number
                    )));
                }

                debug!(tx_hash = ?tx_hash, "Awaiting confirmation");
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(SettlementError::ConfirmationTimeout {
                tx_hash,
                waited_secs: timeout.as_secs(),
            }),
        }
    }
}

fn is_already_known(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("already known") || lower.contains("known transaction")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
