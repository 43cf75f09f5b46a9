//! Shared engine state.
//!
//! Owned by the settlement engine behind an `Arc` and read concurrently by
//! the dashboard. Counters and the last outcome live under one lock so a
//! reader never sees one updated without the other.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::types::{
    BalanceObservation, ConnectionState, EnginePhase, ExecutionCounters, ExecutionRecord,
};

/// Counters plus the most recent completed tick.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub counters: ExecutionCounters,
    pub last: Option<ExecutionRecord>,
}

pub struct EngineState {
    connection: RwLock<ConnectionState>,
    phase: RwLock<EnginePhase>,
    progress: RwLock<Progress>,
    balance: RwLock<Option<BalanceObservation>>,
    started_at: DateTime<Utc>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            connection: RwLock::new(ConnectionState::Initializing),
            phase: RwLock::new(EnginePhase::Idle),
            progress: RwLock::new(Progress::default()),
            balance: RwLock::new(None),
            started_at: Utc::now(),
        }
    }

    pub async fn connection(&self) -> ConnectionState {
        *self.connection.read().await
    }

    pub(crate) async fn set_connection(&self, state: ConnectionState) {
        *self.connection.write().await = state;
    }

    pub async fn phase(&self) -> EnginePhase {
        *self.phase.read().await
    }

    pub(crate) async fn set_phase(&self, phase: EnginePhase) {
        *self.phase.write().await = phase;
    }

    pub async fn counters(&self) -> ExecutionCounters {
        self.progress.read().await.counters.clone()
    }

    pub async fn last_outcome(&self) -> Option<ExecutionRecord> {
        self.progress.read().await.last.clone()
    }

    pub async fn progress(&self) -> Progress {
        self.progress.read().await.clone()
    }

    /// Apply a mutation to counters and last outcome as one step.
    pub(crate) async fn update_progress<F: FnOnce(&mut Progress)>(&self, f: F) {
        let mut progress = self.progress.write().await;
        f(&mut progress);
    }

    pub async fn balance(&self) -> Option<BalanceObservation> {
        self.balance.read().await.clone()
    }

    pub(crate) async fn observe_balance(&self, balance: Decimal) {
        *self.balance.write().await = Some(BalanceObservation {
            balance,
            observed_at: Utc::now(),
        });
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Read-only view served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub connection: ConnectionState,
    pub phase: EnginePhase,
    pub account: String,
    pub chain_id: u64,
    pub quorum: usize,
    pub endpoints: usize,
    pub balance: Option<BalanceObservation>,
    pub counters: ExecutionCounters,
    pub last_outcome: Option<ExecutionRecord>,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
