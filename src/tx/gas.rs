//! Gas limit and fee estimation

use crate::chain::{Chain, ChainNodeClient};
use crate::config::GasConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::job::{GasPriority, TxType};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use std::sync::Arc;
use tracing::debug;

/// Blocks sampled when estimating the priority tip
const FEE_HISTORY_BLOCKS: u64 = 5;

/// Tip used when the fee history carries no rewards (2 gwei)
const DEFAULT_PRIORITY_FEE: u64 = 2_000_000_000;

/// Gas price types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

/// Pluggable gas strategy used by the crafter
#[async_trait]
pub trait GasPricer: Send + Sync {
    async fn gas_price(
        &self,
        chain: &Chain,
        tx_type: TxType,
        priority: GasPriority,
    ) -> DispatchResult<GasPrice>;

    async fn gas_limit(&self, chain: &Chain, tx: &TypedTransaction) -> DispatchResult<U256>;
}

/// Gas estimator over node suggestions
pub struct GasEstimator {
    node: Arc<dyn ChainNodeClient>,
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new(node: Arc<dyn ChainNodeClient>, config: &GasConfig) -> Self {
        Self {
            node,
            gas_limit_buffer_percent: config.gas_limit_buffer_percent,
            gas_price_buffer_percent: config.gas_price_buffer_percent,
        }
    }

    fn with_buffer(value: U256, percent: u64) -> U256 {
        value + value * percent / 100
    }

    async fn dynamic_fees(&self, chain: &Chain, priority: GasPriority) -> DispatchResult<GasPrice> {
        let history = self
            .node
            .fee_history(chain, FEE_HISTORY_BLOCKS, &[priority.reward_percentile()])
            .await?;

        // The last entry is the base fee of the next block
        let base_fee = history
            .base_fee_per_gas
            .last()
            .copied()
            .ok_or_else(|| DispatchError::NodeRejected("fee history has no base fee".into()))?;

        let rewards: Vec<U256> = history
            .reward
            .iter()
            .filter_map(|block| block.first().copied())
            .filter(|reward| !reward.is_zero())
            .collect();
        let priority_fee = if rewards.is_empty() {
            U256::from(DEFAULT_PRIORITY_FEE)
        } else {
            rewards.iter().fold(U256::zero(), |acc, r| acc + *r) / rewards.len()
        };
        let priority_fee = Self::with_buffer(priority_fee, self.gas_price_buffer_percent);

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        Ok(GasPrice::Eip1559 {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority_fee,
        })
    }
}

#[async_trait]
impl GasPricer for GasEstimator {
    async fn gas_price(
        &self,
        chain: &Chain,
        tx_type: TxType,
        priority: GasPriority,
    ) -> DispatchResult<GasPrice> {
        let price = match tx_type {
            TxType::DynamicFee => self.dynamic_fees(chain, priority).await?,
            TxType::Legacy => {
                let suggested = self.node.suggest_gas_price(chain).await?;
                GasPrice::Legacy(Self::with_buffer(
                    suggested,
                    self.gas_price_buffer_percent + priority.legacy_bump_percent(),
                ))
            }
        };

        debug!("Gas price for chain {}: {:?}", chain.chain_id, price);
        Ok(price)
    }

    async fn gas_limit(&self, chain: &Chain, tx: &TypedTransaction) -> DispatchResult<U256> {
        let estimated = self.node.estimate_gas(chain, tx).await?;
        Ok(Self::with_buffer(estimated, self.gas_limit_buffer_percent))
    }
}
