//! Chain module - chain registry and node access
//!
//! This module provides:
//! - The chain registry collaborator (chain lookup, faucet candidates)
//! - A registry backed by the `[chains]` and `[[faucets]]` config sections
//! - The chain node client used for nonces, gas and broadcasting

pub mod provider;

pub use provider::{ChainNodeClient, EthNodeClient};

use crate::config::{FaucetConfig, Settings};
use crate::error::{DispatchError, DispatchResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, U256};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A chain registered for dispatching
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub uuid: Uuid,
    pub name: String,
    pub tenant_id: String,
    pub chain_id: u64,
    pub rpc_url: String,
    /// Tessera REST endpoint, required for Tessera private payloads
    pub private_tx_manager_url: Option<String>,
    /// Privacy precompile targeted by EEA marking transactions
    pub privacy_precompile: Option<Address>,
    /// Whether the chain accepts dynamic-fee transactions
    pub dynamic_fees: bool,
}

/// A funding source able to credit an account before its first transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Faucet {
    pub uuid: Uuid,
    pub chain_uuid: Uuid,
    pub creditor: Address,
    pub amount: U256,
}

/// Chain registry collaborator
#[async_trait]
pub trait ChainRegistry: Send + Sync {
    /// Look up a chain visible to `tenant_id` by name
    async fn get_chain_by_name(&self, tenant_id: &str, name: &str) -> DispatchResult<Chain>;

    async fn get_chain(&self, tenant_id: &str, uuid: Uuid) -> DispatchResult<Chain>;

    /// Faucet eligible to fund `account` on `chain`, if any
    async fn get_faucet_candidate(
        &self,
        account: Address,
        chain: &Chain,
    ) -> DispatchResult<Option<Faucet>>;
}

struct FaucetEntry {
    faucet: Faucet,
    cooldown: Duration,
}

/// Registry over statically configured chains and faucets
pub struct ConfigChainRegistry {
    chains: Vec<Chain>,
    faucets: Vec<FaucetEntry>,
    /// Last funding per (faucet, account)
    last_funded: DashMap<(Uuid, Address), Instant>,
}

impl ConfigChainRegistry {
    pub fn new(chains: Vec<Chain>) -> Self {
        Self {
            chains,
            faucets: Vec::new(),
            last_funded: DashMap::new(),
        }
    }

    pub fn with_faucet(mut self, faucet: Faucet, cooldown: Duration) -> Self {
        self.faucets.push(FaucetEntry { faucet, cooldown });
        self
    }

    /// Build the registry from the enabled chains of the settings
    pub fn from_settings(settings: &Settings) -> DispatchResult<Self> {
        let mut chains = Vec::new();
        for (name, config) in settings.enabled_chains() {
            let privacy_precompile = config
                .privacy_precompile
                .as_deref()
                .map(|addr| {
                    addr.parse::<Address>().map_err(|e| {
                        DispatchError::Config(format!("chain {name}: bad privacy precompile: {e}"))
                    })
                })
                .transpose()?;

            chains.push(Chain {
                uuid: config.uuid,
                name: name.clone(),
                tenant_id: config.tenant_id.clone(),
                chain_id: config.chain_id,
                rpc_url: config.rpc_url.clone(),
                private_tx_manager_url: config.private_tx_manager_url.clone(),
                privacy_precompile,
                dynamic_fees: config.dynamic_fees,
            });
            info!("Registered chain {} (ID: {})", name, config.chain_id);
        }

        let mut registry = Self::new(chains);
        for faucet in &settings.faucets {
            match registry.faucet_from_config(faucet) {
                Ok(Some(entry)) => registry.faucets.push(entry),
                Ok(None) => {}
                Err(e) => warn!("Skipping faucet {}: {}", faucet.uuid, e),
            }
        }

        Ok(registry)
    }

    fn faucet_from_config(&self, config: &FaucetConfig) -> DispatchResult<Option<FaucetEntry>> {
        let Some(chain) = self.chains.iter().find(|c| c.name == config.chain) else {
            // Faucet on a disabled chain
            return Ok(None);
        };
        let creditor = config
            .creditor_account
            .parse::<Address>()
            .map_err(|e| DispatchError::Config(format!("bad creditor account: {e}")))?;
        let amount = U256::from_dec_str(&config.amount_wei)
            .map_err(|e| DispatchError::Config(format!("bad faucet amount: {e}")))?;

        Ok(Some(FaucetEntry {
            faucet: Faucet {
                uuid: config.uuid,
                chain_uuid: chain.uuid,
                creditor,
                amount,
            },
            cooldown: Duration::from_secs(config.cooldown_secs),
        }))
    }

    fn visible_to(chain: &Chain, tenant_id: &str) -> bool {
        chain.tenant_id == tenant_id || chain.tenant_id == crate::config::default_tenant()
    }
}

#[async_trait]
impl ChainRegistry for ConfigChainRegistry {
    async fn get_chain_by_name(&self, tenant_id: &str, name: &str) -> DispatchResult<Chain> {
        self.chains
            .iter()
            .find(|c| c.name == name && Self::visible_to(c, tenant_id))
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(format!("chain {name}")))
    }

    async fn get_chain(&self, tenant_id: &str, uuid: Uuid) -> DispatchResult<Chain> {
        self.chains
            .iter()
            .find(|c| c.uuid == uuid && Self::visible_to(c, tenant_id))
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(format!("chain {uuid}")))
    }

    async fn get_faucet_candidate(
        &self,
        account: Address,
        chain: &Chain,
    ) -> DispatchResult<Option<Faucet>> {
        let now = Instant::now();
        for entry in self.faucets.iter().filter(|e| e.faucet.chain_uuid == chain.uuid) {
            if entry.faucet.creditor == account {
                continue;
            }

            let key = (entry.faucet.uuid, account);
            let cooling = self
                .last_funded
                .get(&key)
                .map(|last| now.duration_since(*last) < entry.cooldown)
                .unwrap_or(false);
            if cooling {
                debug!(faucet = %entry.faucet.uuid, ?account, "Faucet cooling down");
                continue;
            }

            self.last_funded.insert(key, now);
            return Ok(Some(entry.faucet.clone()));
        }

        Ok(None)
    }
}
