//! QUORUM SETTLER: scheduled settlement agent
//!
//! Entry point. Loads configuration, initialises structured logging,
//! builds the endpoint pool and signer, and runs the timer-driven
//! settlement loop with graceful shutdown.

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use quorum_settler::config;
use quorum_settler::dashboard;
use quorum_settler::engine::settlement::{EngineSettings, SettlementEngine};
use quorum_settler::engine::signer::{AccountSigner, SignerSettings};
use quorum_settler::rpc::http::HttpEndpoint;
use quorum_settler::rpc::quorum::{PooledEndpoint, QuorumClient, QuorumSettings};
use quorum_settler::signals::RandomOracle;
use quorum_settler::types::{ExecutionRecord, Trigger};

const BANNER: &str = r#"
  ___                              ____       _   _   _
 / _ \ _   _  ___  _ __ _   _ _ __/ ___|  ___| |_| |_| | ___ _ __
| | | | | | |/ _ \| '__| | | | '_ \___ \ / _ \ __| __| |/ _ \ '__|
| |_| | |_| | (_) | |  | |_| | | | |__) |  __/ |_| |_| |  __/ |
 \__\_\\__,_|\___/|_|   \__,_|_| |_|____/ \___|\__|\__|_|\___|_|

  Quorum-verified scheduled settlement
  v0.1.0
"#;

const WEI_PER_GWEI: u64 = 1_000_000_000;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        tick_interval_secs = cfg.agent.tick_interval_secs,
        chain_id = cfg.network.chain_id,
        quorum = cfg.network.quorum,
        "Settler starting up"
    );

    // -- Initialise components -------------------------------------------

    let mut pool = Vec::new();
    for endpoint in cfg.endpoint_pool() {
        let node = HttpEndpoint::new(endpoint.clone(), cfg.request_timeout())?;
        pool.push(PooledEndpoint::new(endpoint, Arc::new(node)));
    }
    let client = Arc::new(QuorumClient::new(
        pool,
        cfg.network.quorum,
        QuorumSettings {
            request_timeout: cfg.request_timeout(),
            connect_timeout: cfg.connect_timeout(),
            poll_interval: cfg.poll_interval(),
        },
    )?);

    let signer = match cfg.signing_key() {
        Some(key) => {
            let settings = SignerSettings {
                gas_limit: cfg.settlement.gas_limit,
                priority_fee: U256::from(cfg.settlement.priority_fee_gwei)
                    * U256::from(WEI_PER_GWEI),
                confirmation_timeout: cfg.confirmation_timeout(),
            };
            let signer = AccountSigner::from_secret(&key, Arc::clone(&client), settings)?;
            info!(address = ?signer.address(), "Signing account loaded");
            Some(signer)
        }
        None => {
            warn!(
                env = %cfg.settlement.private_key_env,
                "No signing key configured, ticks will report signing_unavailable"
            );
            None
        }
    };

    let watch_address = cfg
        .settlement
        .watch_address
        .as_deref()
        .map(|a| a.trim().parse::<Address>())
        .transpose()
        .context("settlement.watch_address is not a valid address")?;

    let oracle = Arc::new(RandomOracle::new(cfg.agent.signal_hit_probability));
    let engine = Arc::new(
        SettlementEngine::new(
            client,
            signer,
            oracle,
            EngineSettings {
                min_balance: cfg.settlement.min_balance_eth,
                transfer_amount: cfg.settlement.transfer_amount_eth,
                batch_size: cfg.agent.signal_batch_size,
            },
        )
        .with_watch_address(watch_address),
    );

    // A failed first connect is not fatal; each tick reconnects as needed.
    if let Err(e) = engine.connect().await {
        warn!(error = %e, "Initial connection failed, will retry on next tick");
    }

    if cfg.dashboard.enabled {
        dashboard::spawn_dashboard(Arc::clone(&engine), cfg.dashboard.port).await?;
    }

    // -- Main loop -------------------------------------------------------

    let mut interval = tokio::time::interval(cfg.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.agent.tick_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let handle = engine.spawn_tick(Trigger::Timer);
                tokio::spawn(async move {
                    match handle.await {
                        Ok(record) => log_tick(&record),
                        Err(e) => error!(error = %e, "Tick task panicked"),
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    let counters = engine.state().counters().await;
    info!(
        ticks = counters.ticks_completed,
        checks = counters.total_checks,
        transfers = counters.transfers_confirmed,
        realized = %counters.total_realized,
        "Settler shut down cleanly."
    );

    Ok(())
}

/// Log a one-line tick summary.
fn log_tick(record: &ExecutionRecord) {
    info!(
        tick_id = %record.tick_id,
        trigger = ?record.trigger,
        outcome = record.outcome.label(),
        checks = record.signals_checked,
        elapsed_ms = (record.finished_at - record.started_at).num_milliseconds(),
        "Tick complete"
    );
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("quorum_settler=info"));

    let json_logging = std::env::var("SETTLER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
