//! Chain node client over JSON-RPC, plus the Tessera REST API

use super::Chain;
use crate::error::{DispatchError, DispatchResult};

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, FeeHistory, H256, U256};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Node errors meaning the exact transaction is already in the pool
pub const DEFAULT_KNOWN_TX_PATTERNS: &[&str] = &[
    "already known",
    "known transaction",
    "transaction already imported",
];

/// Chain node collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainNodeClient: Send + Sync {
    async fn pending_nonce_at(&self, chain: &Chain, account: Address) -> DispatchResult<u64>;

    /// Private nonce of `account` inside a privacy group
    async fn priv_nonce(
        &self,
        chain: &Chain,
        account: Address,
        privacy_group_id: &str,
    ) -> DispatchResult<u64>;

    /// Private nonce of `account` for an EEA (private_from, private_for) pair
    async fn priv_eea_nonce(
        &self,
        chain: &Chain,
        account: Address,
        private_from: &str,
        private_for: &[String],
    ) -> DispatchResult<u64>;

    async fn suggest_gas_price(&self, chain: &Chain) -> DispatchResult<U256>;

    async fn fee_history(
        &self,
        chain: &Chain,
        block_count: u64,
        reward_percentiles: &[f64],
    ) -> DispatchResult<FeeHistory>;

    async fn estimate_gas(&self, chain: &Chain, tx: &TypedTransaction) -> DispatchResult<U256>;

    async fn send_raw_transaction(&self, chain: &Chain, raw: &Bytes) -> DispatchResult<H256>;

    /// Returns the enclave key of the distributed payload
    async fn priv_distribute_raw_transaction(
        &self,
        chain: &Chain,
        raw: &Bytes,
    ) -> DispatchResult<String>;

    async fn send_quorum_raw_private_transaction(
        &self,
        chain: &Chain,
        raw: &Bytes,
        private_for: &[String],
        privacy_flag: Option<i32>,
    ) -> DispatchResult<H256>;

    /// Stores a private payload in Tessera, returning its enclave key
    async fn store_raw(
        &self,
        chain: &Chain,
        payload: &Bytes,
        private_from: &str,
    ) -> DispatchResult<String>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrivateArgs<'a> {
    private_for: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    privacy_flag: Option<i32>,
}

#[derive(Serialize)]
struct StoreRawRequest<'a> {
    payload: String,
    from: &'a str,
}

#[derive(Deserialize)]
struct StoreRawResponse {
    key: String,
}

/// Node client over ethers HTTP providers, one per RPC URL
pub struct EthNodeClient {
    providers: DashMap<String, Provider<Http>>,
    http: reqwest::Client,
    timeout: Duration,
    known_tx_patterns: Vec<String>,
}

impl EthNodeClient {
    pub fn new(timeout: Duration, known_tx_patterns: Option<Vec<String>>) -> DispatchResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Config(format!("http client: {e}")))?;

        Ok(Self {
            providers: DashMap::new(),
            http,
            timeout,
            known_tx_patterns: known_tx_patterns.unwrap_or_else(|| {
                DEFAULT_KNOWN_TX_PATTERNS
                    .iter()
                    .map(|p| p.to_string())
                    .collect()
            }),
        })
    }

    fn provider(&self, chain: &Chain) -> DispatchResult<Provider<Http>> {
        if let Some(provider) = self.providers.get(&chain.rpc_url) {
            return Ok(provider.clone());
        }

        let provider = Provider::<Http>::try_from(chain.rpc_url.as_str())
            .map_err(|e| DispatchError::Config(format!("chain {}: bad RPC URL: {e}", chain.name)))?;
        debug!("Added HTTP provider for chain {}: {}", chain.chain_id, chain.rpc_url);
        self.providers
            .insert(chain.rpc_url.clone(), provider.clone());
        Ok(provider)
    }

    /// Run a node call under the request deadline
    async fn call<T, F>(&self, method: &str, fut: F) -> DispatchResult<T>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| self.map_provider_error(method, e)),
            Err(_) => Err(DispatchError::Connection(format!("{method}: request timed out"))),
        }
    }

    fn map_provider_error(&self, method: &str, err: ProviderError) -> DispatchError {
        match &err {
            ProviderError::JsonRpcClientError(inner) => {
                if let Some(response) = inner.as_error_response() {
                    self.classify_node_message(method, &response.message)
                } else if inner.is_serde_error() {
                    DispatchError::Encoding(format!("{method}: {err}"))
                } else {
                    DispatchError::Connection(format!("{method}: {err}"))
                }
            }
            ProviderError::HTTPError(_) => DispatchError::Connection(format!("{method}: {err}")),
            ProviderError::SerdeJson(_) | ProviderError::HexError(_) => {
                DispatchError::Encoding(format!("{method}: {err}"))
            }
            _ => DispatchError::NodeRejected(format!("{method}: {err}")),
        }
    }

    fn classify_node_message(&self, method: &str, message: &str) -> DispatchError {
        let lower = message.to_lowercase();
        if self.known_tx_patterns.iter().any(|p| lower.contains(p.as_str())) {
            DispatchError::KnownTransaction(format!("{method}: {message}"))
        } else {
            DispatchError::NodeRejected(format!("{method}: {message}"))
        }
    }
}

#[async_trait]
impl ChainNodeClient for EthNodeClient {
    async fn pending_nonce_at(&self, chain: &Chain, account: Address) -> DispatchResult<u64> {
        let provider = self.provider(chain)?;
        let nonce = self
            .call(
                "eth_getTransactionCount",
                provider.get_transaction_count(account, Some(BlockNumber::Pending.into())),
            )
            .await?;
        Ok(nonce.as_u64())
    }

    async fn priv_nonce(
        &self,
        chain: &Chain,
        account: Address,
        privacy_group_id: &str,
    ) -> DispatchResult<u64> {
        let provider = self.provider(chain)?;
        let nonce: U256 = self
            .call(
                "priv_getTransactionCount",
                provider.request("priv_getTransactionCount", (account, privacy_group_id)),
            )
            .await?;
        Ok(nonce.as_u64())
    }

    async fn priv_eea_nonce(
        &self,
        chain: &Chain,
        account: Address,
        private_from: &str,
        private_for: &[String],
    ) -> DispatchResult<u64> {
        let provider = self.provider(chain)?;
        let nonce: U256 = self
            .call(
                "priv_getEeaTransactionCount",
                provider.request(
                    "priv_getEeaTransactionCount",
                    (account, private_from, private_for),
                ),
            )
            .await?;
        Ok(nonce.as_u64())
    }

    async fn suggest_gas_price(&self, chain: &Chain) -> DispatchResult<U256> {
        let provider = self.provider(chain)?;
        self.call("eth_gasPrice", provider.get_gas_price()).await
    }

    async fn fee_history(
        &self,
        chain: &Chain,
        block_count: u64,
        reward_percentiles: &[f64],
    ) -> DispatchResult<FeeHistory> {
        let provider = self.provider(chain)?;
        self.call(
            "eth_feeHistory",
            provider.fee_history(block_count, BlockNumber::Latest, reward_percentiles),
        )
        .await
    }

    async fn estimate_gas(&self, chain: &Chain, tx: &TypedTransaction) -> DispatchResult<U256> {
        let provider = self.provider(chain)?;
        self.call("eth_estimateGas", provider.estimate_gas(tx, None))
            .await
    }

    async fn send_raw_transaction(&self, chain: &Chain, raw: &Bytes) -> DispatchResult<H256> {
        let provider = self.provider(chain)?;
        self.call("eth_sendRawTransaction", async {
            provider
                .send_raw_transaction(raw.clone())
                .await
                .map(|pending| pending.tx_hash())
        })
        .await
    }

    async fn priv_distribute_raw_transaction(
        &self,
        chain: &Chain,
        raw: &Bytes,
    ) -> DispatchResult<String> {
        let provider = self.provider(chain)?;
        self.call(
            "priv_distributeRawTransaction",
            provider.request("priv_distributeRawTransaction", [raw]),
        )
        .await
    }

    async fn send_quorum_raw_private_transaction(
        &self,
        chain: &Chain,
        raw: &Bytes,
        private_for: &[String],
        privacy_flag: Option<i32>,
    ) -> DispatchResult<H256> {
        let provider = self.provider(chain)?;
        let args = PrivateArgs {
            private_for,
            privacy_flag,
        };
        self.call(
            "eth_sendRawPrivateTransaction",
            provider.request("eth_sendRawPrivateTransaction", (raw, args)),
        )
        .await
    }

    async fn store_raw(
        &self,
        chain: &Chain,
        payload: &Bytes,
        private_from: &str,
    ) -> DispatchResult<String> {
        let base_url = chain.private_tx_manager_url.as_deref().ok_or_else(|| {
            DispatchError::InvalidParameter(format!(
                "chain {} has no private transaction manager",
                chain.name
            ))
        })?;

        let body = StoreRawRequest {
            payload: base64::engine::general_purpose::STANDARD.encode(payload),
            from: private_from,
        };

        let response = self
            .http
            .post(format!("{}/storeraw", base_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Tessera storeraw rejected with {}: {}", status, text);
            return Err(if status.is_server_error() {
                DispatchError::Connection(format!("storeraw: {status}: {text}"))
            } else {
                DispatchError::NodeRejected(format!("storeraw: {status}: {text}"))
            });
        }

        let stored: StoreRawResponse = response.json().await.map_err(map_http_error)?;
        Ok(stored.key)
    }
}

fn map_http_error(err: reqwest::Error) -> DispatchError {
    if err.is_decode() {
        DispatchError::Encoding(format!("storeraw: {err}"))
    } else if err.is_timeout() || err.is_connect() || err.is_request() {
        DispatchError::Connection(format!("storeraw: {err}"))
    } else {
        DispatchError::NodeRejected(format!("storeraw: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> EthNodeClient {
        EthNodeClient::new(Duration::from_millis(200), None).unwrap()
    }

    #[test]
    fn already_known_is_a_known_transaction() {
        let err = client().classify_node_message("eth_sendRawTransaction", "Already known");
        assert!(matches!(err, DispatchError::KnownTransaction(_)));

        let err = client().classify_node_message("eth_sendRawTransaction", "nonce too low");
        assert!(matches!(err, DispatchError::NodeRejected(_)));
    }

    #[tokio::test]
    async fn unreachable_node_is_a_connection_error() {
        let chain = Chain {
            uuid: uuid::Uuid::new_v4(),
            name: "local".into(),
            tenant_id: "_".into(),
            chain_id: 1337,
            rpc_url: "http://127.0.0.1:1".into(),
            private_tx_manager_url: None,
            privacy_precompile: None,
            dynamic_fees: false,
        };

        let err = client()
            .pending_nonce_at(&chain, Address::zero())
            .await
            .unwrap_err();
        assert!(err.is_connection(), "unexpected error {err:?}");
    }
}
