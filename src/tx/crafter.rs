//! Transaction crafting: gas, fees and nonce

use super::gas::{GasPrice, GasPricer};
use super::nonce::{NonceSequencer, PartitionGuard};
use crate::chain::Chain;
use crate::error::{DispatchError, DispatchResult};
use crate::job::{EthTransaction, Job, JobType, TxType};

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Eip1559TransactionRequest, TransactionRequest, U256};
use std::sync::Arc;
use tracing::debug;

/// Build an ethers transaction from a job payload
pub fn to_typed_transaction(tx: &EthTransaction, chain_id: Option<u64>) -> TypedTransaction {
    match tx.tx_type {
        TxType::Legacy => {
            let mut request = TransactionRequest::new();
            request.from = tx.from;
            request.to = tx.to.map(Into::into);
            request.value = tx.value;
            request.gas = tx.gas;
            request.gas_price = tx.gas_price;
            request.data = tx.data.clone();
            request.nonce = tx.nonce.map(U256::from);
            request.chain_id = chain_id.map(Into::into);
            TypedTransaction::Legacy(request)
        }
        TxType::DynamicFee => {
            let mut request = Eip1559TransactionRequest::new();
            request.from = tx.from;
            request.to = tx.to.map(Into::into);
            request.value = tx.value;
            request.gas = tx.gas;
            request.max_fee_per_gas = tx.gas_fee_cap;
            request.max_priority_fee_per_gas = tx.gas_tip_cap;
            request.data = tx.data.clone();
            request.nonce = tx.nonce.map(U256::from);
            request.chain_id = chain_id.map(Into::into);
            TypedTransaction::Eip1559(request)
        }
    }
}

/// Fills gas, fee and nonce fields of a job's transaction
pub struct TransactionCrafter {
    gas: Arc<dyn GasPricer>,
    sequencer: Arc<NonceSequencer>,
    /// Gas limit of private transactions, which cannot be estimated on the public state
    private_gas_limit: u64,
}

impl TransactionCrafter {
    pub fn new(gas: Arc<dyn GasPricer>, sequencer: Arc<NonceSequencer>, private_gas_limit: u64) -> Self {
        Self {
            gas,
            sequencer,
            private_gas_limit,
        }
    }

    /// Craft the job. `partition` must be held for jobs that consume a nonce.
    pub async fn craft(
        &self,
        chain: &Chain,
        job: &mut Job,
        partition: Option<&PartitionGuard>,
    ) -> DispatchResult<()> {
        let private = matches!(
            job.job_type,
            JobType::EeaPrivateTransaction | JobType::TesseraMarkingTransaction
        );
        if private || !chain.dynamic_fees {
            job.transaction.tx_type = TxType::Legacy;
        }

        if !job.transaction.has_fee_fields() {
            match self
                .gas
                .gas_price(chain, job.transaction.tx_type, job.internal.priority)
                .await?
            {
                GasPrice::Legacy(price) => job.transaction.gas_price = Some(price),
                GasPrice::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                } => {
                    job.transaction.gas_fee_cap = Some(max_fee_per_gas);
                    job.transaction.gas_tip_cap = Some(max_priority_fee_per_gas);
                }
            }
        }

        if job.transaction.gas.is_none() {
            let limit = if private {
                U256::from(self.private_gas_limit)
            } else {
                let estimate = to_typed_transaction(&job.transaction, Some(chain.chain_id));
                self.gas.gas_limit(chain, &estimate).await?
            };
            job.transaction.gas = Some(limit);
        }

        if job.transaction.nonce.is_none() {
            let nonce = if job.internal.one_time_key {
                0
            } else if let Some(guard) = partition {
                self.sequencer.get_nonce(guard, chain, job).await?
            } else {
                return Err(DispatchError::InvalidState(format!(
                    "job {} needs a nonce but its partition is not held",
                    job.uuid
                )));
            };
            job.transaction.nonce = Some(nonce);
        }

        debug!(
            job_uuid = %job.uuid,
            nonce = ?job.transaction.nonce,
            gas = ?job.transaction.gas,
            "Crafted transaction"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::provider::MockChainNodeClient;
    use crate::config::GasConfig;
    use crate::job::InternalData;
    use crate::tx::gas::GasEstimator;
    use crate::tx::nonce::{MemoryNonceCache, SubstringClassifier};
    use ethers::types::Address;
    use std::time::Duration;
    use uuid::Uuid;

    fn chain(dynamic_fees: bool) -> Chain {
        Chain {
            uuid: Uuid::new_v4(),
            name: "besu".into(),
            tenant_id: "_".into(),
            chain_id: 1337,
            rpc_url: "http://localhost:8545".into(),
            private_tx_manager_url: None,
            privacy_precompile: None,
            dynamic_fees,
        }
    }

    fn crafter() -> TransactionCrafter {
        let mut node = MockChainNodeClient::new();
        node.expect_suggest_gas_price()
            .returning(|_| Ok(U256::from(100u64)));
        node.expect_estimate_gas()
            .returning(|_, _| Ok(U256::from(50_000u64)));
        node.expect_pending_nonce_at().returning(|_, _| Ok(11));
        let node = Arc::new(node);

        let sequencer = NonceSequencer::new(
            Arc::new(MemoryNonceCache::new(Duration::from_secs(60))),
            node.clone(),
            Arc::new(SubstringClassifier::default()),
            3,
        );
        TransactionCrafter::new(
            Arc::new(GasEstimator::new(node, &GasConfig::default())),
            Arc::new(sequencer),
            3_000_000,
        )
    }

    fn job(job_type: JobType) -> Job {
        Job::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "tenant",
            job_type,
            EthTransaction {
                from: Some(Address::random()),
                to: Some(Address::random()),
                tx_type: TxType::DynamicFee,
                ..Default::default()
            },
            InternalData {
                chain_id: 1337,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn fills_legacy_fields_and_nonce() {
        let crafter = crafter();
        let mut job = job(JobType::EthereumTransaction);
        let key = job.partition_key().unwrap();
        let guard = crafter.sequencer.acquire(&key).await;

        crafter.craft(&chain(false), &mut job, Some(&guard)).await.unwrap();

        assert_eq!(job.transaction.tx_type, TxType::Legacy);
        // 10% buffer + 10% medium bump
        assert_eq!(job.transaction.gas_price, Some(U256::from(120u64)));
        assert_eq!(job.transaction.gas, Some(U256::from(60_000u64)));
        assert_eq!(job.transaction.nonce, Some(11));
    }

    #[tokio::test]
    async fn private_jobs_use_fixed_gas_limit() {
        let crafter = crafter();
        let mut job = job(JobType::TesseraMarkingTransaction);
        let key = job.partition_key().unwrap();
        let guard = crafter.sequencer.acquire(&key).await;

        crafter.craft(&chain(true), &mut job, Some(&guard)).await.unwrap();

        assert_eq!(job.transaction.tx_type, TxType::Legacy);
        assert_eq!(job.transaction.gas, Some(U256::from(3_000_000u64)));
    }

    #[tokio::test]
    async fn one_time_key_starts_at_zero() {
        let crafter = crafter();
        let mut job = job(JobType::EthereumTransaction);
        job.internal.one_time_key = true;

        crafter.craft(&chain(false), &mut job, None).await.unwrap();
        assert_eq!(job.transaction.nonce, Some(0));
    }

    #[tokio::test]
    async fn preset_fields_are_kept() {
        let crafter = crafter();
        let mut job = job(JobType::EthereumTransaction);
        job.transaction.gas = Some(U256::from(21_000u64));
        job.transaction.gas_price = Some(U256::from(7u64));
        job.transaction.nonce = Some(42);

        crafter.craft(&chain(false), &mut job, None).await.unwrap();
        assert_eq!(job.transaction.gas, Some(U256::from(21_000u64)));
        assert_eq!(job.transaction.gas_price, Some(U256::from(7u64)));
        assert_eq!(job.transaction.nonce, Some(42));
    }
}
