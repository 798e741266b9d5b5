//! Test utilities: mock collaborators and a wired service harness.

pub mod mocks;

pub use mocks::{FlakyStore, MockNodeClient, RecordingPublisher, SentTransaction};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::chain::{Chain, ConfigChainRegistry, Faucet};
use crate::config::{BackoffConfig, DispatcherConfig, GasConfig};
use crate::job::{PrivateProtocol, TxParams};
use crate::schedule::SendTxRequest;
use crate::service::{Collaborators, Services};
use crate::state::{JobStore, MemoryStore};
use crate::tx::{LocalKeyManager, MemoryNonceCache};

pub const TEST_TENANT: &str = "tenant-a";
pub const TEST_CHAIN: &str = "besu";

/// Well-known development key
pub const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
/// Second development key, used as faucet creditor
pub const CREDITOR_KEY: &str = "8f2a55949038a9610f50fb23b5883af3b4ecb3c3bb792cbcefbd1542c692be63";

pub const PRIVATE_FROM: &str = "A1aVtMxLCUHmBVHXoZzzBgPbW/wj5axDpW9X8l91SGo=";
pub const PRIVATE_FOR: &str = "Ko2bVqD+nNlNYL5EE7y3IdOnviftjiizpjRt+HTuFBs=";

#[must_use]
pub fn test_wallet() -> LocalWallet {
    TEST_KEY.parse().unwrap()
}

#[must_use]
pub fn creditor_wallet() -> LocalWallet {
    CREDITOR_KEY.parse().unwrap()
}

#[must_use]
pub fn test_account() -> Address {
    test_wallet().address()
}

/// Chain visible to every tenant, with EEA and Tessera privacy
#[must_use]
pub fn test_chain() -> Chain {
    Chain {
        uuid: Uuid::new_v4(),
        name: TEST_CHAIN.into(),
        tenant_id: crate::config::default_tenant(),
        chain_id: 1337,
        rpc_url: "http://localhost:8545".into(),
        private_tx_manager_url: Some("http://localhost:9080".into()),
        privacy_precompile: Some(Address::from_low_u64_be(0x7e)),
        dynamic_fees: false,
    }
}

/// Dispatcher settings with millisecond backoff so retry paths finish quickly
#[must_use]
pub fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        instance_id: "test".into(),
        max_concurrent_jobs: 8,
        max_recovery: 3,
        backoff: BackoffConfig {
            initial_interval_ms: 1,
            multiplier: 1.5,
            max_interval_ms: 5,
            max_elapsed_ms: 10_000,
            max_attempts: 6,
        },
        ..Default::default()
    }
}

/// Plain value transfer from the test account
#[must_use]
pub fn transfer_request(idempotency_key: Option<&str>) -> SendTxRequest {
    SendTxRequest {
        idempotency_key: idempotency_key.map(str::to_string),
        chain_name: TEST_CHAIN.into(),
        params: TxParams {
            from: Some(test_account()),
            to: Some(Address::from_low_u64_be(0xbeef)),
            value: Some(U256::from(1_000u64)),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Private transaction from the test account
#[must_use]
pub fn private_request(protocol: PrivateProtocol) -> SendTxRequest {
    let mut request = transfer_request(None);
    request.params.value = None;
    request.params.data = Some(vec![0xca, 0xfe].into());
    request.params.protocol = Some(protocol);
    request.params.private_from = Some(PRIVATE_FROM.into());
    request.params.private_for = vec![PRIVATE_FOR.into()];
    request
}

/// Services wired over in-memory collaborators
pub struct TestHarness {
    pub services: Services,
    pub node: Arc<MockNodeClient>,
    pub store: Arc<dyn JobStore>,
    pub chain: Chain,
}

pub struct HarnessBuilder {
    config: DispatcherConfig,
    store: Arc<dyn JobStore>,
    node: Arc<MockNodeClient>,
    chain: Chain,
    faucet: Option<(Faucet, Duration)>,
}

impl HarnessBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: test_config(),
            store: Arc::new(MemoryStore::new()),
            node: Arc::new(MockNodeClient::new()),
            chain: test_chain(),
            faucet: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn chain(mut self, chain: Chain) -> Self {
        self.chain = chain;
        self
    }

    /// Register a faucet crediting `amount` from the creditor wallet
    #[must_use]
    pub fn faucet(mut self, amount: U256) -> Self {
        let faucet = Faucet {
            uuid: Uuid::new_v4(),
            chain_uuid: self.chain.uuid,
            creditor: creditor_wallet().address(),
            amount,
        };
        self.faucet = Some((faucet, Duration::from_secs(3600)));
        self
    }

    #[must_use]
    pub fn build(self) -> TestHarness {
        let mut registry = ConfigChainRegistry::new(vec![self.chain.clone()]);
        if let Some((faucet, cooldown)) = self.faucet {
            registry = registry.with_faucet(faucet, cooldown);
        }
        let key_manager = LocalKeyManager::new(vec![test_wallet(), creditor_wallet()]);

        let services = Services::new(
            &self.config,
            &GasConfig::default(),
            Collaborators {
                registry: Arc::new(registry),
                store: self.store.clone(),
                node: self.node.clone(),
                key_manager: Arc::new(key_manager),
                nonce_cache: Arc::new(MemoryNonceCache::new(self.config.nonce_cache_ttl())),
            },
        );

        TestHarness {
            services,
            node: self.node,
            store: self.store,
            chain: self.chain,
        }
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use]
pub fn harness() -> TestHarness {
    HarnessBuilder::new().build()
}
