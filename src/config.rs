//! Configuration management for the dispatcher
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub gas: GasConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub faucets: Vec<FaucetConfig>,
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    pub instance_id: String,
    pub max_concurrent_jobs: usize,
    /// Nonce recoveries allowed per job before the job fails
    pub max_recovery: u32,
    pub nonce_cache_ttl_secs: u64,
    /// Deadline for every outbound network call
    pub request_timeout_ms: u64,
    /// Unacknowledged message count above which publishing logs a warning
    pub transport_capacity: usize,
    #[serde(default)]
    pub nonce_error_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub known_tx_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            instance_id: "dispatcher".to_string(),
            max_concurrent_jobs: 32,
            max_recovery: 5,
            nonce_cache_ttl_secs: 600,
            request_timeout_ms: 10_000,
            transport_capacity: 1024,
            nonce_error_patterns: None,
            known_tx_patterns: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn nonce_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub max_elapsed_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            multiplier: 2.0,
            max_interval_ms: 10_000,
            max_elapsed_ms: 120_000,
            max_attempts: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    /// Buffer percentage on top of estimated gas limits
    pub gas_limit_buffer_percent: u64,
    /// Buffer percentage on top of node gas price suggestions
    pub gas_price_buffer_percent: u64,
    /// Gas limit used for private payloads, which cannot be estimated publicly
    pub private_gas_limit: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
            private_gas_limit: 3_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub uuid: uuid::Uuid,
    pub chain_id: u64,
    /// Tenant owning the chain, `_` for chains shared by all tenants
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub rpc_url: String,
    #[serde(default)]
    pub private_tx_manager_url: Option<String>,
    #[serde(default)]
    pub privacy_precompile: Option<String>,
    #[serde(default)]
    pub dynamic_fees: bool,
    pub enabled: bool,
}

pub fn default_tenant() -> String {
    "_".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FaucetConfig {
    pub uuid: uuid::Uuid,
    /// Name of the chain in `[chains]`
    pub chain: String,
    pub creditor_account: String,
    pub amount_wei: String,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Env var holding comma separated hex signing keys
    pub private_keys_env: String,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("DISPATCHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        if self.dispatcher.max_concurrent_jobs == 0 {
            anyhow::bail!("dispatcher.max_concurrent_jobs must be positive");
        }

        if self.dispatcher.backoff.max_attempts == 0 {
            anyhow::bail!("dispatcher.backoff.max_attempts must be positive");
        }

        if self.database.backend == StoreBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("database.url is required for the postgres backend");
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_url.is_empty() {
                anyhow::bail!("Chain {} has no RPC URL configured", name);
            }
        }

        for faucet in &self.faucets {
            if !self.chains.contains_key(&faucet.chain) {
                anyhow::bail!("Faucet {} refers to unknown chain {}", faucet.uuid, faucet.chain);
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}
