//! Account signer.
//!
//! Holds the one private key this process may sign with and turns a
//! transfer request into a signed, broadcast, and confirmed EIP-1559
//! transaction. Submitted transfers are never retried automatically.

use anyhow::{Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Eip1559TransactionRequest, U256};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::rpc::quorum::QuorumClient;
use crate::types::{from_wei, FeeEstimate, SettlementError, TransferReceipt};

/// Gas used by a plain value transfer.
pub const TRANSFER_GAS: u64 = 21_000;

#[derive(Debug, Clone)]
pub struct SignerSettings {
    pub gas_limit: u64,
    /// Tip offered to block producers, in wei.
    pub priority_fee: U256,
    /// Upper bound on the confirmation wait.
    pub confirmation_timeout: Duration,
}

impl Default for SignerSettings {
    fn default() -> Self {
        Self {
            gas_limit: TRANSFER_GAS,
            priority_fee: U256::from(1_500_000_000u64),
            confirmation_timeout: Duration::from_secs(90),
        }
    }
}

pub struct AccountSigner {
    wallet: LocalWallet,
    client: Arc<QuorumClient>,
    settings: SignerSettings,
}

impl fmt::Debug for AccountSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountSigner")
            .field("address", &self.wallet.address())
            .field("chain_id", &self.wallet.chain_id())
            .finish_non_exhaustive()
    }
}

impl AccountSigner {
    /// Parse a hex private key (with or without `0x`) bound to the client's chain.
    pub fn from_secret(
        key: &SecretString,
        client: Arc<QuorumClient>,
        settings: SignerSettings,
    ) -> Result<Self> {
        let wallet: LocalWallet = key
            .expose_secret()
            .trim()
            .parse()
            .context("Failed to parse signing key")?;
        let wallet = wallet.with_chain_id(client.chain_id());

        Ok(Self {
            wallet,
            client,
            settings,
        })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Highest fee a transfer may burn at current prices, in wei.
    pub async fn worst_case_fee(&self) -> Result<U256, SettlementError> {
        let fee = self.client.get_fee_estimate().await?;
        Ok(self.gas_cost(self.max_fee_per_gas(&fee)))
    }

    fn max_fee_per_gas(&self, fee: &FeeEstimate) -> U256 {
        fee.gas_price
            .saturating_mul(U256::from(2))
            .saturating_add(self.settings.priority_fee)
    }

    fn gas_cost(&self, max_fee_per_gas: U256) -> U256 {
        max_fee_per_gas.saturating_mul(U256::from(self.settings.gas_limit))
    }

    /// Sign and submit a transfer of exactly `amount` wei to `recipient`,
    /// then wait for confirmation.
    ///
    /// Funds are checked before anything is broadcast: first against the
    /// amount alone, then against amount plus the worst-case fee.
    pub async fn transfer(
        &self,
        amount: U256,
        recipient: Address,
    ) -> Result<TransferReceipt, SettlementError> {
        let from = self.address();

        let balance = self.client.get_balance(from).await?;
        if balance < amount {
            return Err(SettlementError::InsufficientFunds {
                balance: from_wei(balance),
                required: from_wei(amount),
            });
        }

        let fee = self.client.get_fee_estimate().await?;
        let tip = self.settings.priority_fee;
        let max_fee_per_gas = self.max_fee_per_gas(&fee);
        let max_cost = amount.saturating_add(self.gas_cost(max_fee_per_gas));
        if balance < max_cost {
            return Err(SettlementError::InsufficientFunds {
                balance: from_wei(balance),
                required: from_wei(max_cost),
            });
        }

        let nonce = self.client.get_nonce(from).await?;

        let request = Eip1559TransactionRequest::new()
            .from(from)
            .to(recipient)
            .value(amount)
            .nonce(nonce)
            .gas(self.settings.gas_limit)
            .max_fee_per_gas(max_fee_per_gas)
            .max_priority_fee_per_gas(tip)
            .chain_id(self.client.chain_id());
        let tx: TypedTransaction = request.into();

        let signature = self
            .wallet
            .sign_transaction_sync(&tx)
            .map_err(|e| SettlementError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let tx_hash = tx.hash(&signature);

        info!(
            tx_hash = ?tx_hash,
            to = ?recipient,
            amount = %from_wei(amount),
            nonce = %nonce,
            max_fee_per_gas = %max_fee_per_gas,
            "Submitting transfer"
        );

        let handle = self.client.submit(raw, tx_hash).await?;

        let confirmation = self
            .client
            .await_confirmation(&handle, self.settings.confirmation_timeout)
            .await
            .map_err(|e| {
                if let SettlementError::ConfirmationTimeout { .. } = e {
                    warn!(tx_hash = ?tx_hash, "Transfer not confirmed in time; it may still land");
                }
                e
            })?;

        info!(
            tx_hash = ?tx_hash,
            block = confirmation.block_number,
            "Transfer confirmed"
        );

        Ok(TransferReceipt {
            tx_hash,
            block_number: confirmation.block_number,
            block_hash: confirmation.block_hash,
            amount: from_wei(amount),
            max_fee_per_gas,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
