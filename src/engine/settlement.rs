//! Settlement engine: the scheduled balance → signals → transfer pipeline.
//!
//! Every tick, timer-driven or manual, goes through `run_tick`, which holds
//! a non-blocking single-flight guard for the whole tick. A tick that finds
//! the guard taken is reported as skipped. Failures end the tick, never the
//! engine.

use chrono::Utc;
use ethers::types::{Address, U256};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::accountant::Accountant;
use crate::engine::signer::AccountSigner;
use crate::engine::state::{EngineState, StatusSnapshot};
use crate::rpc::quorum::QuorumClient;
use crate::signals::SignalOracle;
use crate::types::{
    from_wei, to_wei, ConnectionState, EnginePhase, ErrorKind, ExecutionRecord, SettlementError,
    TickOutcome, TransferReceipt, Trigger,
};

/// Placeholder shown in status when no account is configured.
pub const NO_ACCOUNT: &str = "not configured";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Balance below which ticks report `needs_funding`. Also the reserve
    /// a withdrawal must leave behind.
    pub min_balance: Decimal,
    /// Fixed amount moved by each settling tick.
    pub transfer_amount: Decimal,
    pub batch_size: usize,
}

pub struct SettlementEngine {
    client: Arc<QuorumClient>,
    signer: Option<AccountSigner>,
    oracle: Arc<dyn SignalOracle>,
    state: Arc<EngineState>,
    settings: EngineSettings,
    watch_address: Option<Address>,
    in_flight: Mutex<()>,
}

impl SettlementEngine {
    pub fn new(
        client: Arc<QuorumClient>,
        signer: Option<AccountSigner>,
        oracle: Arc<dyn SignalOracle>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            client,
            signer,
            oracle,
            state: Arc::new(EngineState::new()),
            settings,
            watch_address: None,
            in_flight: Mutex::new(()),
        }
    }

    /// Address shown in status when running without a signer.
    pub fn with_watch_address(mut self, address: Option<Address>) -> Self {
        self.watch_address = address;
        self
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Settlement account, falling back to the watch address.
    pub fn account(&self) -> Option<Address> {
        self.signer
            .as_ref()
            .map(|s| s.address())
            .or(self.watch_address)
    }

    /// (Re)establish endpoint connectivity and publish the connection state.
    pub async fn connect(&self) -> Result<u64, SettlementError> {
        self.state.set_connection(ConnectionState::Connecting).await;
        match self.client.connect().await {
            Ok(height) => {
                self.state.set_connection(ConnectionState::Connected).await;
                info!(height, "Connected to ledger");
                Ok(height)
            }
            Err(e) => {
                self.state.set_connection(ConnectionState::Disconnected).await;
                warn!(error = %e, "Ledger connection failed");
                Err(e)
            }
        }
    }

    /// Spawn one tick as its own task so a slow tick never blocks the timer.
    pub fn spawn_tick(self: &Arc<Self>, trigger: Trigger) -> JoinHandle<ExecutionRecord> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run_tick(trigger).await })
    }

    /// Run one settlement tick and record its outcome.
    pub async fn run_tick(&self, trigger: Trigger) -> ExecutionRecord {
        let tick_id = Uuid::new_v4();
        let started_at = Utc::now();

        let Ok(_guard) = self.in_flight.try_lock() else {
            info!(%tick_id, ?trigger, "Settlement already in flight, skipping tick");
            return ExecutionRecord {
                tick_id,
                trigger,
                outcome: TickOutcome::Skipped {
                    reason: "settlement already in flight".to_string(),
                },
                signals_checked: 0,
                started_at,
                finished_at: Utc::now(),
            };
        };

        let span = info_span!("tick", %tick_id, ?trigger);
        let (outcome, signals_checked) = self.settle().instrument(span).await;

        self.state.set_phase(EnginePhase::RecordingResult).await;
        let record = ExecutionRecord {
            tick_id,
            trigger,
            outcome,
            signals_checked,
            started_at,
            finished_at: Utc::now(),
        };
        Accountant::record(&self.state, &record).await;
        self.state.set_phase(EnginePhase::Idle).await;

        record
    }

    /// The tick body. Returns the outcome and the number of signals checked.
    async fn settle(&self) -> (TickOutcome, u64) {
        if self.state.connection().await != ConnectionState::Connected {
            if let Err(e) = self.connect().await {
                return (TickOutcome::failed(&e), 0);
            }
        }

        let Some(signer) = self.signer.as_ref() else {
            warn!("No signing credential configured");
            return (TickOutcome::failed(&SettlementError::SigningUnavailable), 0);
        };
        let threshold = self.settings.min_balance;

        // -- checking-balance ------------------------------------------------
        self.state.set_phase(EnginePhase::CheckingBalance).await;
        let balance = match self.client.get_balance(signer.address()).await {
            Ok(wei) => from_wei(wei),
            Err(e) => return (self.failure(e, None).await, 0),
        };
        self.state.observe_balance(balance).await;

        if balance < threshold {
            warn!(%balance, %threshold, "Balance below minimum, needs funding");
            return (TickOutcome::NeedsFunding { balance, threshold }, 0);
        }

        // -- evaluating-signals ----------------------------------------------
        self.state.set_phase(EnginePhase::EvaluatingSignals).await;
        let batch = self.oracle.produce_batch(self.settings.batch_size);
        if batch.len() != self.settings.batch_size {
            warn!(
                oracle = self.oracle.name(),
                expected = self.settings.batch_size,
                got = batch.len(),
                "Oracle returned an unexpected batch size"
            );
        }
        let checked = batch.len() as u64;
        let positive = batch.positive_count();
        info!(oracle = self.oracle.name(), checked, positive, "Signals evaluated");

        if positive == 0 {
            return (TickOutcome::NoActionableSignal { signals_checked: checked }, checked);
        }

        // -- transferring ----------------------------------------------------
        // Self-settlement: the fixed amount moves back to the same account.
        self.state.set_phase(EnginePhase::Transferring).await;
        let amount = match to_wei(self.settings.transfer_amount) {
            Ok(wei) => wei,
            Err(e) => return (self.failure(e, Some(balance)).await, checked),
        };

        match signer.transfer(amount, signer.address()).await {
            Ok(receipt) => (
                TickOutcome::Settled {
                    tx_hash: receipt.tx_hash,
                    block_number: receipt.block_number,
                    block_hash: receipt.block_hash,
                    amount: receipt.amount,
                    positive_signals: positive,
                },
                checked,
            ),
            Err(SettlementError::ConfirmationTimeout {
                tx_hash,
                waited_secs,
            }) => (
                TickOutcome::Unconfirmed {
                    tx_hash,
                    waited_secs,
                    positive_signals: positive,
                },
                checked,
            ),
            Err(e) => (self.failure(e, Some(balance)).await, checked),
        }
    }

    /// Turn an error into a recorded failure with diagnostics.
    async fn failure(&self, err: SettlementError, balance: Option<Decimal>) -> TickOutcome {
        self.note_connection(&err).await;
        warn!(error = %err, kind = ?err.kind(), "Settlement tick failed");
        TickOutcome::Failed {
            error: err.kind(),
            message: err.to_string(),
            balance,
            threshold: Some(self.settings.min_balance),
        }
    }

    /// A connection failure means the pool is no longer usable.
    async fn note_connection(&self, err: &SettlementError) {
        if err.kind() == ErrorKind::ConnectionFailure {
            self.state.set_connection(ConnectionState::Disconnected).await;
        }
    }

    /// Withdraw `amount` ETH to `to`, leaving the minimum balance in place
    /// after the worst-case fee.
    ///
    /// Shares the single-flight guard with settlement ticks.
    pub async fn withdraw(
        &self,
        amount: Decimal,
        to: Address,
    ) -> Result<TransferReceipt, SettlementError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or(SettlementError::SigningUnavailable)?;
        if amount <= Decimal::ZERO {
            return Err(SettlementError::InvalidRequest(format!(
                "amount must be positive, got {amount}"
            )));
        }
        let amount_wei = to_wei(amount)?;

        let _guard = self
            .in_flight
            .try_lock()
            .map_err(|_| SettlementError::Busy)?;

        let result = self.withdraw_locked(signer, amount, amount_wei, to).await;
        if let Err(e) = &result {
            self.note_connection(e).await;
        }
        result
    }

    async fn withdraw_locked(
        &self,
        signer: &AccountSigner,
        amount: Decimal,
        amount_wei: U256,
        to: Address,
    ) -> Result<TransferReceipt, SettlementError> {
        if self.state.connection().await != ConnectionState::Connected {
            self.connect().await?;
        }

        let balance = from_wei(self.client.get_balance(signer.address()).await?);
        self.state.observe_balance(balance).await;

        let fee = from_wei(signer.worst_case_fee().await?);
        let reserve = self.settings.min_balance;
        if amount + fee > balance - reserve {
            warn!(%amount, %balance, %reserve, %fee, "Withdrawal exceeds available balance");
            return Err(SettlementError::InsufficientFunds {
                balance,
                required: amount + fee + reserve,
            });
        }

        info!(%amount, to = ?to, "Withdrawal approved");
        signer.transfer(amount_wei, to).await
    }

    /// Point-in-time status; performs no I/O.
    pub async fn status(&self) -> StatusSnapshot {
        let progress = self.state.progress().await;
        let now = Utc::now();
        StatusSnapshot {
            connection: self.state.connection().await,
            phase: self.state.phase().await,
            account: self
                .account()
                .map(|a| format!("{a:?}"))
                .unwrap_or_else(|| NO_ACCOUNT.to_string()),
            chain_id: self.client.chain_id(),
            quorum: self.client.quorum(),
            endpoints: self.client.endpoints().count(),
            balance: self.state.balance().await,
            counters: progress.counters,
            last_outcome: progress.last,
            timestamp: now,
            uptime_secs: (now - self.state.started_at()).num_seconds(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
