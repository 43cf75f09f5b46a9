//! Accountant: counter bookkeeping for completed ticks.
//!
//! Folds each finished tick into the cumulative counters and replaces the
//! last outcome. Counters only ever grow.

use tracing::info;

use crate::engine::state::EngineState;
use crate::types::{ExecutionRecord, TickOutcome};

pub struct Accountant;

impl Accountant {
    /// Record a completed tick. Skipped ticks are not recorded.
    pub async fn record(state: &EngineState, record: &ExecutionRecord) {
        if record.outcome.is_skipped() {
            return;
        }

        let realized = record.outcome.realized();
        let settled = matches!(record.outcome, TickOutcome::Settled { .. });

        state
            .update_progress(|progress| {
                let counters = &mut progress.counters;
                counters.total_checks += record.signals_checked;
                counters.total_realized += realized;
                counters.ticks_completed += 1;
                if settled {
                    counters.transfers_confirmed += 1;
                }
                progress.last = Some(record.clone());
            })
            .await;

        let counters = state.counters().await;
        info!(
            tick_id = %record.tick_id,
            outcome = record.outcome.label(),
            checks = record.signals_checked,
            realized = %realized,
            total_checks = counters.total_checks,
            total_realized = %counters.total_realized,
            "Tick recorded"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
