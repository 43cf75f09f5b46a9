//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (the signing key, a private RPC URL) are referenced by env-var
//! name in the config and resolved at runtime via `std::env::var`.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::types::{to_wei, Endpoint};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub network: NetworkConfig,
    pub settlement: SettlementConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub tick_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub signal_batch_size: usize,
    #[serde(default = "default_hit_probability")]
    pub signal_hit_probability: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    pub chain_id: u64,
    #[serde(default = "default_quorum")]
    pub quorum: usize,
    pub endpoints: Vec<String>,
    /// Env var holding an operator-supplied endpoint, tried first.
    #[serde(default)]
    pub trusted_endpoint_env: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SettlementConfig {
    pub min_balance_eth: Decimal,
    pub transfer_amount_eth: Decimal,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_priority_fee_gwei")]
    pub priority_fee_gwei: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub private_key_env: String,
    /// Address to report in status when no key is configured.
    #[serde(default)]
    pub watch_address: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_batch_size() -> usize {
    450
}

fn default_hit_probability() -> f64 {
    0.001
}

fn default_quorum() -> usize {
    1
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_gas_limit() -> u64 {
    21_000
}

fn default_priority_fee_gwei() -> u64 {
    2
}

fn default_confirmation_timeout_secs() -> u64 {
    90
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let net = &self.network;
        if net.endpoints.is_empty() && net.trusted_endpoint_env.is_none() {
            bail!("network.endpoints must list at least one endpoint");
        }
        if net.quorum == 0 {
            bail!("network.quorum must be at least 1");
        }
        let max_pool = net.endpoints.len() + usize::from(net.trusted_endpoint_env.is_some());
        if net.quorum > max_pool {
            bail!(
                "network.quorum {} exceeds the {max_pool} configured endpoints",
                net.quorum
            );
        }
        if self.agent.tick_interval_secs == 0 {
            bail!("agent.tick_interval_secs must be positive");
        }
        if self.agent.signal_batch_size == 0 {
            bail!("agent.signal_batch_size must be positive");
        }
        if !(0.0..=1.0).contains(&self.agent.signal_hit_probability) {
            bail!("agent.signal_hit_probability must be within [0, 1]");
        }
        let s = &self.settlement;
        if s.transfer_amount_eth <= Decimal::ZERO {
            bail!("settlement.transfer_amount_eth must be positive");
        }
        if let Err(e) = to_wei(s.transfer_amount_eth) {
            bail!("settlement.transfer_amount_eth is not a whole number of wei: {e}");
        }
        if s.min_balance_eth < Decimal::ZERO {
            bail!("settlement.min_balance_eth must not be negative");
        }
        if s.gas_limit < 21_000 {
            bail!("settlement.gas_limit must cover a plain transfer (21000)");
        }
        Ok(())
    }

    /// Endpoint pool in priority order; the trusted endpoint, if set,
    /// is prepended.
    pub fn endpoint_pool(&self) -> Vec<Endpoint> {
        let mut pool: Vec<Endpoint> = self
            .network
            .endpoints
            .iter()
            .map(|url| Endpoint::new(url.clone(), self.network.chain_id))
            .collect();

        if let Some(url) = self
            .network
            .trusted_endpoint_env
            .as_deref()
            .and_then(|env| std::env::var(env).ok())
            .filter(|url| !url.trim().is_empty())
        {
            pool.retain(|e| e.url != url);
            pool.insert(0, Endpoint::new(url, self.network.chain_id));
        }

        pool
    }

    /// The signing key, if its env var is set and non-empty.
    pub fn signing_key(&self) -> Option<SecretString> {
        std::env::var(&self.settlement.private_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::new)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.network.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.network.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.settlement.poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.settlement.confirmation_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.agent.tick_interval_secs)
    }
}
