//! Quorum agreement across a pool of in-memory endpoints.

use std::sync::Arc;
use std::time::Duration;

use quorum_settler::rpc::quorum::{QuorumClient, QuorumSettings};
use quorum_settler::types::{ErrorKind, SettlementError};

use crate::mock_endpoint::{eth, pooled, MockEndpoint};
use ethers::types::{Address, Bytes, H256};

fn fast_settings() -> QuorumSettings {
    QuorumSettings {
        request_timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(5),
    }
}

fn client(nodes: &[Arc<MockEndpoint>], quorum: usize) -> QuorumClient {
    let pool = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| pooled(Arc::clone(n), i))
        .collect();
    QuorumClient::new(pool, quorum, fast_settings()).unwrap()
}

fn nodes(balances: &[&str]) -> Vec<Arc<MockEndpoint>> {
    balances.iter().map(|b| Arc::new(MockEndpoint::new(b))).collect()
}

#[tokio::test]
async fn test_two_of_three_agree() {
    let pool = nodes(&["10", "10", "7"]);
    let client = client(&pool, 2);

    let balance = client.get_balance(Address::zero()).await.unwrap();
    assert_eq!(balance, eth("10"));
}

#[tokio::test]
async fn test_no_two_agree() {
    let pool = nodes(&["10", "7", "3"]);
    let client = client(&pool, 2);

    let err = client.get_balance(Address::zero()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoQuorum);
    match err {
        SettlementError::NoQuorum {
            required,
            best_agreement,
            responded,
            ..
        } => {
            assert_eq!(required, 2);
            assert_eq!(best_agreement, 1);
            assert_eq!(responded, 3);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_dead_endpoint_below_quorum() {
    let pool = nodes(&["10", "10", "10"]);
    pool[1].set_down(true);
    pool[2].set_down(true);
    let client = client(&pool, 2);

    let err = client.get_balance(Address::zero()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoQuorum);
}

#[tokio::test]
async fn test_single_endpoint_quorum_tolerates_dead_nodes() {
    let pool = nodes(&["10", "10"]);
    pool[0].set_down(true);
    let client = client(&pool, 1);

    assert_eq!(client.get_balance(Address::zero()).await.unwrap(), eth("10"));
}

#[tokio::test]
async fn test_slow_endpoint_is_excluded() {
    let pool = vec![
        Arc::new(MockEndpoint::new("10")),
        Arc::new(MockEndpoint::new("10")),
        Arc::new(MockEndpoint::new("4").with_balance_delay(Duration::from_secs(5))),
    ];
    let client = client(&pool, 2);

    let started = std::time::Instant::now();
    assert_eq!(client.get_balance(Address::zero()).await.unwrap(), eth("10"));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_connect_all_down() {
    let pool = nodes(&["1", "1"]);
    for node in &pool {
        node.set_down(true);
    }
    let client = client(&pool, 1);

    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
}

#[tokio::test]
async fn test_connect_one_alive() {
    let pool = nodes(&["1", "1", "1"]);
    pool[0].set_down(true);
    pool[2].set_down(true);
    let client = client(&pool, 2);

    assert!(client.connect().await.is_ok());
}

#[tokio::test]
async fn test_broadcast_needs_one_acceptance() {
    let pool = nodes(&["1", "1"]);
    pool[0].set_down(true);
    let client = client(&pool, 1);

    let raw = Bytes::from(vec![0x02, 0xaa, 0xbb]);
    let hash = H256::from(ethers::utils::keccak256(&raw));
    let handle = client.submit(raw, hash).await.unwrap();

    assert_eq!(handle.accepted_by, 1);
    assert_eq!(pool[1].transactions(), vec![hash]);

    let confirmation = client
        .await_confirmation(&handle, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(confirmation.tx_hash, hash);
}

#[tokio::test]
async fn test_broadcast_all_down() {
    let pool = nodes(&["1", "1"]);
    for node in &pool {
        node.set_down(true);
    }
    let client = client(&pool, 1);

    let err = client
        .submit(Bytes::from(vec![0x01]), H256::zero())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
}
