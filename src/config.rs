//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API credentials) are referenced by env-var name in the config
//! and resolved at startup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::exchange::client::{ClientConfig, RetryPolicy, DEFAULT_BASE_URL};
use crate::types::{native_from_coins, Asset};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub orders: OrdersConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_base_asset")]
    pub base_asset: Asset,
    #[serde(default = "default_managed_assets")]
    pub managed_assets: Vec<Asset>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
    #[serde(default = "default_public_cache_ttl_ms")]
    pub public_cache_ttl_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_balances_interval_ms")]
    pub balances_interval_ms: u64,
    #[serde(default = "default_fast_interval_ms")]
    pub rates_interval_ms: u64,
    #[serde(default = "default_fast_interval_ms")]
    pub spreads_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrdersConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// In coins.
    #[serde(default = "default_min_trade_size")]
    pub min_trade_size: f64,
    /// In coins of the quote asset.
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_report_interval_secs")]
    pub interval_secs: u64,
}

fn default_tick_interval_secs() -> u64 { 10 }
fn default_base_asset() -> Asset { Asset::Btc }
fn default_managed_assets() -> Vec<Asset> { vec![Asset::Btc, Asset::Eth, Asset::Ltc] }
fn default_base_url() -> String { DEFAULT_BASE_URL.to_string() }
fn default_access_key_env() -> String { "COINBASE_API_ACCESS_KEY".to_string() }
fn default_secret_key_env() -> String { "COINBASE_API_SECRET_KEY".to_string() }
fn default_passphrase_env() -> String { "COINBASE_API_PASSPHRASE".to_string() }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_base_delay_ms() -> u64 { 1000 }
fn default_retry_jitter_ms() -> u64 { 2000 }
fn default_public_cache_ttl_ms() -> u64 { 1000 }
fn default_balances_interval_ms() -> u64 { 3000 }
fn default_fast_interval_ms() -> u64 { 1000 }
fn default_queue_capacity() -> usize { 2 }
fn default_min_trade_size() -> f64 { 0.01 }
fn default_tick_size() -> f64 { 0.00001 }
fn default_report_interval_secs() -> u64 { 2 }

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            access_key_env: default_access_key_env(),
            secret_key_env: default_secret_key_env(),
            passphrase_env: default_passphrase_env(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
            public_cache_ttl_ms: default_public_cache_ttl_ms(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            balances_interval_ms: default_balances_interval_ms(),
            rates_interval_ms: default_fast_interval_ms(),
            spreads_interval_ms: default_fast_interval_ms(),
        }
    }
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            min_trade_size: default_min_trade_size(),
            tick_size: default_tick_size(),
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self { enabled: false, endpoint: None, interval_secs: default_report_interval_secs() }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse and validate configuration text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let agent = &self.agent;
        if agent.managed_assets.is_empty() {
            anyhow::bail!("agent.managed_assets must not be empty");
        }
        if !agent.managed_assets.contains(&agent.base_asset) {
            anyhow::bail!("agent.base_asset {} must be a managed asset", agent.base_asset);
        }
        for asset in &agent.managed_assets {
            if *asset != agent.base_asset && asset.trading_product(agent.base_asset).is_none() {
                anyhow::bail!("{asset} has no product quoted in {}", agent.base_asset);
            }
        }
        if agent.tick_interval_secs == 0 {
            anyhow::bail!("agent.tick_interval_secs must be positive");
        }
        if self.orders.tick_size <= 0.0 || self.orders.min_trade_size < 0.0 {
            anyhow::bail!("orders.tick_size must be positive and orders.min_trade_size non-negative");
        }
        if self.reporting.enabled && self.reporting.endpoint.is_none() {
            anyhow::bail!("reporting.endpoint is required when reporting is enabled");
        }
        Ok(())
    }

    /// Whether the process should run without touching open orders.
    /// The `DRY_RUN` environment variable overrides the file.
    pub fn dry_run(&self) -> bool {
        match std::env::var("DRY_RUN") {
            Ok(v) => env_flag(&v),
            Err(_) => self.agent.dry_run,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let ex = &self.exchange;
        ClientConfig {
            base_url: ex.base_url.clone(),
            timeout: Duration::from_secs(ex.request_timeout_secs),
            retry: RetryPolicy {
                max_retries: ex.max_retries,
                base_delay: Duration::from_millis(ex.retry_base_delay_ms),
                jitter: Duration::from_millis(ex.retry_jitter_ms),
            },
            public_cache_ttl: Duration::from_millis(ex.public_cache_ttl_ms),
        }
    }

    pub fn min_trade_native(&self) -> i64 {
        native_from_coins(self.orders.min_trade_size)
    }

    pub fn tick_native(&self) -> i64 {
        native_from_coins(self.orders.tick_size)
    }
}

/// Truthy unless empty or "false" (case-insensitive).
pub fn env_flag(value: &str) -> bool {
    let v = value.trim();
    !v.is_empty() && !v.eq_ignore_ascii_case("false")
}
