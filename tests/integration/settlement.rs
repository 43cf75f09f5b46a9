//! End-to-end settlement ticks and withdrawals over mock endpoints.

use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

use ethers::types::Address;
use quorum_settler::engine::settlement::{EngineSettings, SettlementEngine};
use quorum_settler::engine::signer::{AccountSigner, SignerSettings, TRANSFER_GAS};
use quorum_settler::rpc::quorum::{QuorumClient, QuorumSettings};
use quorum_settler::signals::{FixedOracle, SignalOracle};
use quorum_settler::types::{
    ConnectionState, EnginePhase, ErrorKind, SettlementError, TickOutcome, Trigger,
};

use crate::mock_endpoint::{gwei, pooled, MockEndpoint, ReceiptMode};

const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

/// Build an engine whose pool is `slots` entries all backed by `node`.
fn engine_over(
    node: &Arc<MockEndpoint>,
    slots: usize,
    quorum: usize,
    oracle: impl SignalOracle + 'static,
    confirmation_timeout: Duration,
) -> Arc<SettlementEngine> {
    let pool = (0..slots).map(|i| pooled(Arc::clone(node), i)).collect();
    let client = Arc::new(
        QuorumClient::new(
            pool,
            quorum,
            QuorumSettings {
                request_timeout: Duration::from_secs(1),
                connect_timeout: Duration::from_secs(1),
                poll_interval: Duration::from_millis(5),
            },
        )
        .unwrap(),
    );
    let signer = AccountSigner::from_secret(
        &SecretString::new(TEST_KEY.to_string()),
        Arc::clone(&client),
        SignerSettings {
            gas_limit: TRANSFER_GAS,
            priority_fee: gwei(1),
            confirmation_timeout,
        },
    )
    .unwrap();

    Arc::new(SettlementEngine::new(
        client,
        Some(signer),
        Arc::new(oracle),
        EngineSettings {
            min_balance: dec!(0.01),
            transfer_amount: dec!(0.001),
            batch_size: 450,
        },
    ))
}

fn engine(node: &Arc<MockEndpoint>, oracle: impl SignalOracle + 'static) -> Arc<SettlementEngine> {
    engine_over(node, 3, 2, oracle, Duration::from_secs(2))
}

// ---------------------------------------------------------------------------
// Ticks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_positive_signal_settles_once() {
    let node = Arc::new(MockEndpoint::new("1"));
    let engine = engine(&node, FixedOracle::first_only());

    let record = engine.run_tick(Trigger::Timer).await;

    match &record.outcome {
        TickOutcome::Settled {
            amount,
            positive_signals,
            ..
        } => {
            assert_eq!(*amount, dec!(0.001));
            assert_eq!(*positive_signals, 1);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(node.transactions().len(), 1);

    let counters = engine.state().counters().await;
    assert_eq!(counters.total_checks, 450);
    assert_eq!(counters.total_realized, dec!(0.001));
    assert_eq!(counters.transfers_confirmed, 1);
    assert_eq!(engine.state().phase().await, EnginePhase::Idle);
    assert_eq!(engine.state().connection().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_no_positive_signal_counts_checks_only() {
    let node = Arc::new(MockEndpoint::new("1"));
    let engine = engine(&node, FixedOracle::never());

    let record = engine.run_tick(Trigger::Timer).await;

    assert_eq!(
        record.outcome,
        TickOutcome::NoActionableSignal { signals_checked: 450 }
    );
    assert_eq!(record.signals_checked, 450);
    assert!(node.transactions().is_empty());

    let counters = engine.state().counters().await;
    assert_eq!(counters.total_checks, 450);
    assert_eq!(counters.total_realized, Decimal::ZERO);
}

#[tokio::test]
async fn test_low_balance_needs_funding() {
    let node = Arc::new(MockEndpoint::new("0.005"));
    let engine = engine(&node, FixedOracle::first_only());

    let record = engine.run_tick(Trigger::Timer).await;

    assert_eq!(
        record.outcome,
        TickOutcome::NeedsFunding {
            balance: dec!(0.005),
            threshold: dec!(0.01),
        }
    );
    assert!(node.transactions().is_empty());

    let counters = engine.state().counters().await;
    assert_eq!(counters.total_checks, 0);
    assert_eq!(counters.total_realized, Decimal::ZERO);
    assert_eq!(counters.transfers_confirmed, 0);
}

#[tokio::test]
async fn test_fee_headroom_rejected_before_submission() {
    // 0.0105 ETH covers the threshold and the amount but not a 1000 gwei fee.
    let node = Arc::new(MockEndpoint::new("0.0105").with_gas_price(gwei(1000)));
    let engine = engine(&node, FixedOracle::first_only());

    let record = engine.run_tick(Trigger::Timer).await;

    match record.outcome {
        TickOutcome::Failed {
            error, balance, ..
        } => {
            assert_eq!(error, ErrorKind::InsufficientFunds);
            assert_eq!(balance, Some(dec!(0.0105)));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(node.send_calls(), 0);
    assert_eq!(engine.state().counters().await.total_realized, Decimal::ZERO);
}

#[tokio::test]
async fn test_overlapping_ticks_are_skipped() {
    let node = Arc::new(MockEndpoint::new("1").with_balance_delay(Duration::from_millis(100)));
    let engine = engine(&node, FixedOracle::first_only());

    let handles: Vec<_> = (0..5).map(|_| engine.spawn_tick(Trigger::Timer)).collect();
    let records: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let settled = records
        .iter()
        .filter(|r| matches!(r.outcome, TickOutcome::Settled { .. }))
        .count();
    let skipped = records.iter().filter(|r| r.outcome.is_skipped()).count();
    assert_eq!(settled, 1);
    assert_eq!(skipped, 4);
    assert_eq!(node.transactions().len(), 1);

    let counters = engine.state().counters().await;
    assert_eq!(counters.ticks_completed, 1);
    assert_eq!(counters.total_checks, 450);
}

#[tokio::test]
async fn test_manual_trigger_shares_guard_with_timer() {
    let node = Arc::new(MockEndpoint::new("1").with_balance_delay(Duration::from_millis(100)));
    let engine = engine(&node, FixedOracle::never());

    let timer = engine.spawn_tick(Trigger::Timer);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let manual = engine.run_tick(Trigger::Manual).await;

    assert!(manual.outcome.is_skipped());
    assert!(!timer.await.unwrap().outcome.is_skipped());
}

#[tokio::test]
async fn test_unconfirmed_transfer_realizes_nothing() {
    let node = Arc::new(MockEndpoint::new("1").with_receipts(ReceiptMode::Pending));
    let engine = engine_over(&node, 1, 1, FixedOracle::first_only(), Duration::from_millis(300));

    let tick = engine.spawn_tick(Trigger::Timer);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Still waiting on confirmation: nothing recorded yet.
    assert_eq!(engine.state().phase().await, EnginePhase::Transferring);
    assert!(engine.state().last_outcome().await.is_none());

    let record = tick.await.unwrap();
    assert!(matches!(record.outcome, TickOutcome::Unconfirmed { .. }));
    assert_eq!(node.transactions().len(), 1);

    let counters = engine.state().counters().await;
    assert_eq!(counters.total_realized, Decimal::ZERO);
    assert_eq!(counters.transfers_confirmed, 0);
    assert_eq!(counters.total_checks, 450);
    assert_eq!(
        engine.state().last_outcome().await.unwrap().tick_id,
        record.tick_id
    );
}

#[tokio::test]
async fn test_reverted_transfer_fails_tick() {
    let node = Arc::new(MockEndpoint::new("1").with_receipts(ReceiptMode::Revert));
    let engine = engine(&node, FixedOracle::first_only());

    let record = engine.run_tick(Trigger::Timer).await;

    match record.outcome {
        TickOutcome::Failed { error, .. } => assert_eq!(error, ErrorKind::SubmissionRejected),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(engine.state().counters().await.total_realized, Decimal::ZERO);
}

#[tokio::test]
async fn test_recovers_after_outage() {
    let node = Arc::new(MockEndpoint::new("1"));
    node.set_down(true);
    let engine = engine(&node, FixedOracle::first_only());

    let first = engine.run_tick(Trigger::Timer).await;
    match first.outcome {
        TickOutcome::Failed { error, .. } => assert_eq!(error, ErrorKind::ConnectionFailure),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(engine.state().connection().await, ConnectionState::Disconnected);

    node.set_down(false);
    let second = engine.run_tick(Trigger::Timer).await;
    assert!(matches!(second.outcome, TickOutcome::Settled { .. }));
    assert_eq!(engine.state().connection().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_counters_accumulate_across_ticks() {
    let node = Arc::new(MockEndpoint::new("1"));
    let engine = engine(&node, FixedOracle::first_only());

    for _ in 0..3 {
        engine.run_tick(Trigger::Timer).await;
    }

    let counters = engine.state().counters().await;
    assert_eq!(counters.total_checks, 1350);
    assert_eq!(counters.total_realized, dec!(0.003));
    assert_eq!(counters.transfers_confirmed, 3);
    assert_eq!(node.transactions().len(), 3);
}

#[tokio::test]
async fn test_status_reads_no_ledger_state() {
    let node = Arc::new(MockEndpoint::new("1"));
    let engine = engine(&node, FixedOracle::never());
    engine.run_tick(Trigger::Timer).await;

    let calls = node.balance_calls();
    let status = engine.status().await;
    let again = engine.status().await;

    assert_eq!(node.balance_calls(), calls);
    assert_eq!(status.counters, again.counters);
    assert_eq!(status.balance.map(|b| b.balance), Some(dec!(1)));
    assert_eq!(status.quorum, 2);
    assert_eq!(status.endpoints, 3);
}

// ---------------------------------------------------------------------------
// Withdrawals
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_withdraw_within_available() {
    let node = Arc::new(MockEndpoint::new("1"));
    let engine = engine(&node, FixedOracle::never());

    let receipt = engine
        .withdraw(dec!(0.5), Address::repeat_byte(0x42))
        .await
        .unwrap();

    assert_eq!(receipt.amount, dec!(0.5));
    assert_eq!(node.transactions(), vec![receipt.tx_hash]);
}

#[tokio::test]
async fn test_repeated_over_balance_withdrawals_rejected_identically() {
    let node = Arc::new(MockEndpoint::new("1"));
    let engine = engine(&node, FixedOracle::never());
    let to = Address::repeat_byte(0x42);

    let first = engine.withdraw(dec!(2), to).await.unwrap_err();
    let second = engine.withdraw(dec!(2), to).await.unwrap_err();

    assert_eq!(
        first,
        SettlementError::InsufficientFunds {
            balance: dec!(1),
            // amount + worst-case fee (3 gwei * 21000) + reserve
            required: dec!(2.010063),
        }
    );
    assert_eq!(first, second);
    assert_eq!(node.send_calls(), 0);
}

#[tokio::test]
async fn test_withdraw_must_leave_reserve() {
    let node = Arc::new(MockEndpoint::new("1"));
    let engine = engine(&node, FixedOracle::never());

    let err = engine
        .withdraw(dec!(0.995), Address::repeat_byte(0x42))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
    assert!(node.transactions().is_empty());
}

#[tokio::test]
async fn test_withdraw_reserve_accounts_for_fee() {
    let node = Arc::new(MockEndpoint::new("1"));
    let engine = engine(&node, FixedOracle::never());
    let to = Address::repeat_byte(0x42);

    // Exactly balance - reserve leaves nothing for gas.
    let err = engine.withdraw(dec!(0.99), to).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
    assert_eq!(node.send_calls(), 0);

    let receipt = engine.withdraw(dec!(0.989937), to).await.unwrap();
    assert_eq!(receipt.amount, dec!(0.989937));
}

#[tokio::test]
async fn test_withdraw_rejects_sub_wei_amount() {
    let node = Arc::new(MockEndpoint::new("1"));
    let engine = engine(&node, FixedOracle::never());

    let err = engine
        .withdraw(dec!(0.0000000000000000001), Address::repeat_byte(0x42))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(node.send_calls(), 0);
    assert!(node.transactions().is_empty());
}

#[tokio::test]
async fn test_withdraw_tracks_connection_state() {
    let node = Arc::new(MockEndpoint::new("1"));
    node.set_down(true);
    let engine = engine(&node, FixedOracle::never());
    let to = Address::repeat_byte(0x42);

    let err = engine.withdraw(dec!(0.1), to).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
    assert_eq!(engine.state().connection().await, ConnectionState::Disconnected);

    node.set_down(false);
    engine.withdraw(dec!(0.1), to).await.unwrap();
    assert_eq!(engine.state().connection().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_withdraw_rejects_non_positive_amount() {
    let node = Arc::new(MockEndpoint::new("1"));
    let engine = engine(&node, FixedOracle::never());

    let err = engine
        .withdraw(Decimal::ZERO, Address::repeat_byte(0x42))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(node.balance_calls(), 0);
}

#[tokio::test]
async fn test_withdraw_busy_during_tick() {
    let node = Arc::new(MockEndpoint::new("1").with_balance_delay(Duration::from_millis(100)));
    let engine = engine(&node, FixedOracle::never());

    let tick = engine.spawn_tick(Trigger::Timer);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = engine
        .withdraw(dec!(0.1), Address::repeat_byte(0x42))
        .await
        .unwrap_err();
    assert_eq!(err, SettlementError::Busy);

    tick.await.unwrap();
    node.set_balance("2");
    let receipt = engine
        .withdraw(dec!(0.1), Address::repeat_byte(0x42))
        .await
        .unwrap();
    assert_eq!(receipt.amount, dec!(0.1));
}
