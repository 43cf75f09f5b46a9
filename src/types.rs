//! Core domain types for the settlement agent.
//!
//! Shared across the quorum client, signer, engine, and dashboard.

use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use ethers::utils::{format_ether, parse_ether};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// A remote read/submit endpoint for one ledger network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    pub chain_id: u64,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, chain_id: u64) -> Self {
        Self {
            url: url.into(),
            chain_id,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (chain {})", self.url, self.chain_id)
    }
}

// ---------------------------------------------------------------------------
// Connection state & engine phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Initializing,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Initializing => write!(f, "initializing"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Where the settlement engine currently is within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnginePhase {
    Idle,
    CheckingBalance,
    EvaluatingSignals,
    Transferring,
    RecordingResult,
}

impl fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnginePhase::Idle => "idle",
            EnginePhase::CheckingBalance => "checking-balance",
            EnginePhase::EvaluatingSignals => "evaluating-signals",
            EnginePhase::Transferring => "transferring",
            EnginePhase::RecordingResult => "recording-result",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Ledger values
// ---------------------------------------------------------------------------

/// Fee figure agreed by the endpoint pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEstimate {
    pub gas_price: U256,
}

/// Handle for a broadcast transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHandle {
    pub tx_hash: H256,
    /// Number of endpoints that accepted the payload.
    pub accepted_by: usize,
}

/// Proof that a transaction was included in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Confirmation {
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_hash: H256,
}

/// Result of a confirmed transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_hash: H256,
    pub amount: Decimal,
    pub max_fee_per_gas: U256,
}

impl fmt::Display for TransferReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ETH in {:?} (block #{})",
            self.amount, self.tx_hash, self.block_number
        )
    }
}

/// Last quorum-confirmed balance of the settlement account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceObservation {
    pub balance: Decimal,
    pub observed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tick outcomes
// ---------------------------------------------------------------------------

/// What started a settlement tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Timer,
    Manual,
}

/// Outcome of one settlement tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    Settled {
        tx_hash: H256,
        block_number: u64,
        block_hash: H256,
        amount: Decimal,
        positive_signals: usize,
    },
    /// Submitted but not observed on-chain within the wait window.
    Unconfirmed {
        tx_hash: H256,
        waited_secs: u64,
        positive_signals: usize,
    },
    NeedsFunding {
        balance: Decimal,
        threshold: Decimal,
    },
    NoActionableSignal {
        signals_checked: u64,
    },
    /// Another settlement held the single-flight guard.
    Skipped {
        reason: String,
    },
    Failed {
        error: ErrorKind,
        message: String,
        balance: Option<Decimal>,
        threshold: Option<Decimal>,
    },
}

impl TickOutcome {
    pub fn failed(err: &SettlementError) -> Self {
        TickOutcome::Failed {
            error: err.kind(),
            message: err.to_string(),
            balance: None,
            threshold: None,
        }
    }

    /// Value realized by this outcome; only confirmed settlements count.
    pub fn realized(&self) -> Decimal {
        match self {
            TickOutcome::Settled { amount, .. } => *amount,
            _ => Decimal::ZERO,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TickOutcome::Skipped { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TickOutcome::Settled { .. } => "settled",
            TickOutcome::Unconfirmed { .. } => "unconfirmed",
            TickOutcome::NeedsFunding { .. } => "needs_funding",
            TickOutcome::NoActionableSignal { .. } => "no_actionable_signal",
            TickOutcome::Skipped { .. } => "skipped",
            TickOutcome::Failed { .. } => "failed",
        }
    }
}

/// A completed tick as recorded by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub tick_id: Uuid,
    pub trigger: Trigger,
    pub outcome: TickOutcome,
    pub signals_checked: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Cumulative counters for the process lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionCounters {
    pub total_checks: u64,
    pub total_realized: Decimal,
    pub ticks_completed: u64,
    pub transfers_confirmed: u64,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Serializable classification of a settlement failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoQuorum,
    ConnectionFailure,
    SigningUnavailable,
    InsufficientFunds,
    ConfirmationTimeout,
    SubmissionRejected,
    InvalidRequest,
    Busy,
    Signing,
}

impl ErrorKind {
    /// Upper-case code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NoQuorum => "NO_QUORUM",
            ErrorKind::ConnectionFailure => "CONNECTION_FAILURE",
            ErrorKind::SigningUnavailable => "SIGNING_UNAVAILABLE",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::ConfirmationTimeout => "CONFIRMATION_TIMEOUT",
            ErrorKind::SubmissionRejected => "SUBMISSION_REJECTED",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::Busy => "SETTLEMENT_IN_FLIGHT",
            ErrorKind::Signing => "SIGNING_FAILED",
        }
    }
}

/// Failures of the settlement pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettlementError {
    #[error("No quorum for {operation}: best agreement {best_agreement}/{required} across {responded} responses")]
    NoQuorum {
        operation: &'static str,
        required: usize,
        best_agreement: usize,
        responded: usize,
    },

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Signing unavailable: no credential configured")]
    SigningUnavailable,

    #[error("Insufficient funds: balance {balance} ETH, required {required} ETH")]
    InsufficientFunds { balance: Decimal, required: Decimal },

    #[error("Transaction {tx_hash:?} not confirmed after {waited_secs}s")]
    ConfirmationTimeout { tx_hash: H256, waited_secs: u64 },

    #[error("Submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("A settlement is already in flight")]
    Busy,

    #[error("Signing failed: {0}")]
    Signing(String),
}

impl SettlementError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SettlementError::NoQuorum { .. } => ErrorKind::NoQuorum,
            SettlementError::ConnectionFailure(_) => ErrorKind::ConnectionFailure,
            SettlementError::SigningUnavailable => ErrorKind::SigningUnavailable,
            SettlementError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            SettlementError::ConfirmationTimeout { .. } => ErrorKind::ConfirmationTimeout,
            SettlementError::SubmissionRejected(_) => ErrorKind::SubmissionRejected,
            SettlementError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SettlementError::Busy => ErrorKind::Busy,
            SettlementError::Signing(_) => ErrorKind::Signing,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit conversion
// ---------------------------------------------------------------------------

const WEI_DECIMALS: u32 = 18;

/// Convert a positive ether amount to wei.
///
/// Rejects amounts finer than one wei instead of rounding them away, so a
/// positive amount never becomes a zero-value transfer.
pub fn to_wei(eth: Decimal) -> Result<U256, SettlementError> {
    if eth.is_sign_negative() {
        return Err(SettlementError::InvalidRequest(format!(
            "negative amount: {eth}"
        )));
    }
    let eth = eth.normalize();
    if eth.scale() > WEI_DECIMALS {
        return Err(SettlementError::InvalidRequest(format!(
            "amount {eth} has more than {WEI_DECIMALS} decimal places"
        )));
    }
    let wei = parse_ether(eth.to_string())
        .map_err(|e| SettlementError::InvalidRequest(format!("amount {eth} not representable: {e}")))?;
    if wei.is_zero() {
        return Err(SettlementError::InvalidRequest(format!(
            "amount {eth} is zero wei"
        )));
    }
    Ok(wei)
}

/// Convert wei to ether. Saturates at `Decimal::MAX` for absurd balances.
pub fn from_wei(wei: U256) -> Decimal {
    Decimal::from_str(&format_ether(wei))
        .map(|d| d.normalize())
        .unwrap_or(Decimal::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
