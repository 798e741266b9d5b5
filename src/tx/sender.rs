//! Per-protocol job senders
//!
//! Every sender runs the same pipeline:
//!
//! 1. Take the job's nonce partition (if it has one) for the whole send
//! 2. Craft and sign, unless a resend already carries its raw bytes
//! 3. Broadcast through the protocol specific call
//! 4. Commit the nonce, or reconcile the cache when the node rejected it
//!
//! and hands back the status update describing the outcome. Dropping a send
//! half-way releases the partition without committing anything.

use super::crafter::TransactionCrafter;
use super::nonce::NonceSequencer;
use super::signer::TransactionSigner;
use crate::chain::{Chain, ChainNodeClient, ChainRegistry};
use crate::error::{DispatchError, DispatchResult};
use crate::job::{Job, JobStatus, JobType};
use crate::metrics;
use crate::state::JobUpdate;

use async_trait::async_trait;
use ethers::types::{Bytes, H256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the node handed back for a broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    Hash(H256),
    /// Reference of a payload stored by a privacy manager
    EnclaveKey(String),
}

/// Sends one job and describes the resulting status
#[async_trait]
pub trait JobSender: Send + Sync {
    async fn execute(&self, job: &mut Job) -> DispatchResult<JobUpdate>;
}

/// Protocol specific part of a sender
#[async_trait]
trait Broadcast: Send + Sync {
    /// Whether the job goes through crafting and signing
    fn signs(&self) -> bool {
        true
    }

    async fn broadcast(&self, chain: &Chain, job: &Job) -> DispatchResult<Receipt>;
}

fn signed_raw(job: &Job) -> DispatchResult<&Bytes> {
    job.transaction
        .raw
        .as_ref()
        .ok_or_else(|| DispatchError::InvalidState(format!("job {} is not signed", job.uuid)))
}

/// Collaborators shared by every sender
pub struct SenderContext {
    registry: Arc<dyn ChainRegistry>,
    node: Arc<dyn ChainNodeClient>,
    crafter: Arc<TransactionCrafter>,
    signer: Arc<TransactionSigner>,
    sequencer: Arc<NonceSequencer>,
}

impl SenderContext {
    pub fn new(
        registry: Arc<dyn ChainRegistry>,
        node: Arc<dyn ChainNodeClient>,
        crafter: Arc<TransactionCrafter>,
        signer: Arc<TransactionSigner>,
        sequencer: Arc<NonceSequencer>,
    ) -> Self {
        Self {
            registry,
            node,
            crafter,
            signer,
            sequencer,
        }
    }

    async fn send(&self, protocol: &dyn Broadcast, job: &mut Job) -> DispatchResult<JobUpdate> {
        let chain = self
            .registry
            .get_chain(&job.tenant_id, job.chain_uuid)
            .await
            .map_err(|e| e.in_component("sender"))?;

        let guard = match job.partition_key() {
            Some(key) => Some(self.sequencer.acquire(&key).await),
            None => None,
        };

        let resend = job.is_self_resend()
            || matches!(job.status(), JobStatus::Pending | JobStatus::Resending);
        // A one-time key cannot sign the same transaction twice, so its
        // first signature is kept across retries
        let skip_sign = (resend || job.internal.one_time_key) && job.transaction.raw.is_some();

        if protocol.signs() && !skip_sign {
            self.crafter.craft(&chain, job, guard.as_ref()).await?;
            self.signer.sign(job).await?;
        } else if skip_sign {
            debug!(job_uuid = %job.uuid, "Resending signed transaction");
        }

        let receipt = match protocol.broadcast(&chain, job).await {
            Ok(receipt) => receipt,
            Err(err) => {
                if let Some(guard) = &guard {
                    self.sequencer.clean_nonce(guard, job, &err).await?;
                }
                return Err(err);
            }
        };

        if let Some(guard) = &guard {
            if let Err(e) = self.sequencer.increment_nonce(guard, job).await {
                // The transaction is out; the next send re-reads the chain
                warn!(job_uuid = %job.uuid, partition_key = guard.key(), "Failed to commit nonce: {}", e);
            }
        }
        drop(guard);

        let update = match receipt {
            Receipt::EnclaveKey(key) => {
                info!(job_uuid = %job.uuid, "Private payload stored");
                job.transaction.enclave_key = Some(key);
                JobUpdate::status(JobStatus::Stored)
            }
            Receipt::Hash(hash) => {
                let expected = job.transaction.hash.replace(hash);
                match expected {
                    Some(expected) if expected != hash => {
                        warn!(job_uuid = %job.uuid, ?expected, returned = ?hash, "Node returned another transaction hash");
                        JobUpdate::status(JobStatus::Warning).with_message(format!(
                            "expected hash {expected:?} but node returned {hash:?}"
                        ))
                    }
                    _ if resend => JobUpdate::status(JobStatus::Resending),
                    _ => JobUpdate::status(JobStatus::Pending),
                }
            }
        };

        info!(
            job_uuid = %job.uuid,
            tx_hash = ?job.transaction.hash,
            nonce = ?job.transaction.nonce,
            "Job sent"
        );
        let status = update.status.unwrap_or(JobStatus::Pending);
        metrics::record_job_sent(job.job_type.as_str(), status.as_str());
        Ok(update
            .with_transaction(job.transaction.clone())
            .with_recovery_count(job.internal.recovery_count))
    }
}

macro_rules! job_sender {
    ($name:ident) => {
        pub struct $name {
            ctx: Arc<SenderContext>,
        }

        impl $name {
            pub fn new(ctx: Arc<SenderContext>) -> Self {
                Self { ctx }
            }
        }

        #[async_trait]
        impl JobSender for $name {
            async fn execute(&self, job: &mut Job) -> DispatchResult<JobUpdate> {
                self.ctx.send(self, job).await
            }
        }
    };
}

job_sender!(EthSender);
job_sender!(RawSender);
job_sender!(EeaPrivateSender);
job_sender!(TesseraPrivateSender);
job_sender!(TesseraMarkingSender);

/// Public transactions and EEA marking transactions
#[async_trait]
impl Broadcast for EthSender {
    async fn broadcast(&self, chain: &Chain, job: &Job) -> DispatchResult<Receipt> {
        let hash = self
            .ctx
            .node
            .send_raw_transaction(chain, signed_raw(job)?)
            .await?;
        Ok(Receipt::Hash(hash))
    }
}

/// Client-signed transactions, broadcast untouched
#[async_trait]
impl Broadcast for RawSender {
    fn signs(&self) -> bool {
        false
    }

    async fn broadcast(&self, chain: &Chain, job: &Job) -> DispatchResult<Receipt> {
        let hash = self
            .ctx
            .node
            .send_raw_transaction(chain, signed_raw(job)?)
            .await?;
        Ok(Receipt::Hash(hash))
    }
}

#[async_trait]
impl Broadcast for EeaPrivateSender {
    async fn broadcast(&self, chain: &Chain, job: &Job) -> DispatchResult<Receipt> {
        let key = self
            .ctx
            .node
            .priv_distribute_raw_transaction(chain, signed_raw(job)?)
            .await?;
        Ok(Receipt::EnclaveKey(key))
    }
}

/// Stores the unsigned payload in Tessera; the marking job carries it on-chain
#[async_trait]
impl Broadcast for TesseraPrivateSender {
    fn signs(&self) -> bool {
        false
    }

    async fn broadcast(&self, chain: &Chain, job: &Job) -> DispatchResult<Receipt> {
        let private_from = job.transaction.private_from.as_deref().ok_or_else(|| {
            DispatchError::InvalidParameter(format!("job {} has no private_from", job.uuid))
        })?;
        let payload = job.transaction.data.clone().unwrap_or_default();
        let key = self
            .ctx
            .node
            .store_raw(chain, &payload, private_from)
            .await?;
        Ok(Receipt::EnclaveKey(key))
    }
}

#[async_trait]
impl Broadcast for TesseraMarkingSender {
    async fn broadcast(&self, chain: &Chain, job: &Job) -> DispatchResult<Receipt> {
        let hash = self
            .ctx
            .node
            .send_quorum_raw_private_transaction(
                chain,
                signed_raw(job)?,
                &job.transaction.private_for,
                job.transaction.privacy_flag,
            )
            .await?;
        Ok(Receipt::Hash(hash))
    }
}

/// One sender per job type
pub struct SenderSet {
    eth: EthSender,
    raw: RawSender,
    eea_private: EeaPrivateSender,
    tessera_private: TesseraPrivateSender,
    tessera_marking: TesseraMarkingSender,
}

impl SenderSet {
    pub fn new(ctx: Arc<SenderContext>) -> Self {
        Self {
            eth: EthSender::new(ctx.clone()),
            raw: RawSender::new(ctx.clone()),
            eea_private: EeaPrivateSender::new(ctx.clone()),
            tessera_private: TesseraPrivateSender::new(ctx.clone()),
            tessera_marking: TesseraMarkingSender::new(ctx),
        }
    }

    pub fn sender_for(&self, job_type: JobType) -> &dyn JobSender {
        match job_type {
            JobType::EthereumTransaction | JobType::EeaMarkingTransaction => &self.eth,
            JobType::EthereumRawTransaction => &self.raw,
            JobType::EeaPrivateTransaction => &self.eea_private,
            JobType::TesseraPrivateTransaction => &self.tessera_private,
            JobType::TesseraMarkingTransaction => &self.tessera_marking,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::provider::MockChainNodeClient;
    use crate::chain::ConfigChainRegistry;
    use crate::config::GasConfig;
    use crate::job::{EthTransaction, InternalData};
    use crate::tx::gas::GasEstimator;
    use crate::tx::nonce::{MemoryNonceCache, SubstringClassifier};
    use crate::tx::signer::LocalKeyManager;
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::{Address, U256};
    use ethers::utils::keccak256;
    use std::time::Duration;
    use uuid::Uuid;

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn chain() -> Chain {
        Chain {
            uuid: Uuid::new_v4(),
            name: "besu".into(),
            tenant_id: "_".into(),
            chain_id: 1337,
            rpc_url: "http://localhost:8545".into(),
            private_tx_manager_url: Some("http://localhost:9080".into()),
            privacy_precompile: Some(Address::from_low_u64_be(0x7e)),
            dynamic_fees: false,
        }
    }

    fn senders(chain: &Chain, mut node: MockChainNodeClient) -> (SenderSet, Arc<NonceSequencer>) {
        node.expect_suggest_gas_price()
            .returning(|_| Ok(U256::from(100u64)));
        node.expect_estimate_gas()
            .returning(|_, _| Ok(U256::from(21_000u64)));
        let node: Arc<dyn ChainNodeClient> = Arc::new(node);

        let sequencer = Arc::new(NonceSequencer::new(
            Arc::new(MemoryNonceCache::new(Duration::from_secs(60))),
            node.clone(),
            Arc::new(SubstringClassifier::default()),
            3,
        ));
        let crafter = Arc::new(TransactionCrafter::new(
            Arc::new(GasEstimator::new(node.clone(), &GasConfig::default())),
            sequencer.clone(),
            3_000_000,
        ));
        let wallet: LocalWallet = KEY.parse().unwrap();
        let signer = Arc::new(TransactionSigner::new(Arc::new(LocalKeyManager::new(vec![
            wallet,
        ]))));
        let registry = Arc::new(ConfigChainRegistry::new(vec![chain.clone()]));

        let ctx = Arc::new(SenderContext::new(
            registry,
            node,
            crafter,
            signer,
            sequencer.clone(),
        ));
        (SenderSet::new(ctx), sequencer)
    }

    fn job(chain: &Chain, job_type: JobType) -> Job {
        let wallet: LocalWallet = KEY.parse().unwrap();
        Job::new(
            Uuid::new_v4(),
            chain.uuid,
            "tenant",
            job_type,
            EthTransaction {
                from: Some(wallet.address()),
                to: Some(Address::random()),
                private_from: Some("A1aVtMxLCUHmBVHXoZzzBgPbW/wj5axDpW9X8l91SGo=".into()),
                private_for: vec!["Ko2bVqD+nNlNYL5EE7y3IdOnviftjiizpjRt+HTuFBs=".into()],
                ..Default::default()
            },
            InternalData {
                chain_id: chain.chain_id,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn public_job_is_pending_and_commits_nonce() {
        let chain = chain();
        let mut node = MockChainNodeClient::new();
        node.expect_pending_nonce_at().returning(|_, _| Ok(4));
        node.expect_send_raw_transaction()
            .returning(|_, raw| Ok(H256::from(keccak256(raw))));
        let (senders, sequencer) = senders(&chain, node);

        let mut job = job(&chain, JobType::EthereumTransaction);
        let update = senders
            .sender_for(job.job_type)
            .execute(&mut job)
            .await
            .unwrap();

        assert_eq!(update.status, Some(JobStatus::Pending));
        assert_eq!(job.transaction.nonce, Some(4));
        let tx = update.transaction.unwrap();
        assert!(tx.raw.is_some());
        assert_eq!(tx.hash, Some(H256::from(keccak256(tx.raw.unwrap()))));

        // Next job on the same account continues from the committed nonce
        let guard = sequencer.acquire(&job.partition_key().unwrap()).await;
        let next = sequencer.get_nonce(&guard, &chain, &job).await.unwrap();
        assert_eq!(next, 5);
    }

    #[tokio::test]
    async fn hash_mismatch_is_a_warning() {
        let chain = chain();
        let mut node = MockChainNodeClient::new();
        node.expect_pending_nonce_at().returning(|_, _| Ok(0));
        node.expect_send_raw_transaction()
            .returning(|_, _| Ok(H256::repeat_byte(0xab)));
        let (senders, _) = senders(&chain, node);

        let mut job = job(&chain, JobType::EthereumTransaction);
        let update = senders
            .sender_for(job.job_type)
            .execute(&mut job)
            .await
            .unwrap();

        assert_eq!(update.status, Some(JobStatus::Warning));
        assert!(update.message.unwrap().starts_with("expected hash"));
        assert_eq!(job.transaction.hash, Some(H256::repeat_byte(0xab)));
    }

    #[tokio::test]
    async fn nonce_rejection_resets_job() {
        let chain = chain();
        let mut node = MockChainNodeClient::new();
        node.expect_pending_nonce_at().returning(|_, _| Ok(2));
        node.expect_send_raw_transaction()
            .returning(|_, _| Err(DispatchError::NodeRejected("nonce too low".into())));
        let (senders, _) = senders(&chain, node);

        let mut job = job(&chain, JobType::EthereumTransaction);
        let err = senders
            .sender_for(job.job_type)
            .execute(&mut job)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::InvalidNonceWarning(_)));
        assert_eq!(job.transaction.nonce, None);
        assert_eq!(job.transaction.raw, None);
        assert_eq!(job.internal.recovery_count, 1);
    }

    #[tokio::test]
    async fn resend_reuses_signed_bytes() {
        let chain = chain();
        let mut node = MockChainNodeClient::new();
        node.expect_send_raw_transaction()
            .withf(|_, raw| raw.to_vec() == vec![0xf8, 0x01])
            .returning(|_, raw| Ok(H256::from(keccak256(raw))));
        let (senders, _) = senders(&chain, node);

        let mut job = job(&chain, JobType::EthereumTransaction);
        job.transaction.nonce = Some(9);
        job.transaction.raw = Some(Bytes::from(vec![0xf8, 0x01]));
        job.transaction.hash = Some(H256::from(keccak256([0xf8, 0x01])));
        job.internal.parent_job_uuid = Some(job.uuid);

        let update = senders
            .sender_for(job.job_type)
            .execute(&mut job)
            .await
            .unwrap();
        assert_eq!(update.status, Some(JobStatus::Resending));
        assert_eq!(job.transaction.nonce, Some(9));
    }

    #[tokio::test]
    async fn eea_private_job_is_stored() {
        let chain = chain();
        let mut node = MockChainNodeClient::new();
        node.expect_priv_eea_nonce().returning(|_, _, _, _| Ok(0));
        node.expect_priv_distribute_raw_transaction()
            .returning(|_, _| Ok("0x0102".into()));
        let (senders, _) = senders(&chain, node);

        let mut job = job(&chain, JobType::EeaPrivateTransaction);
        let update = senders
            .sender_for(job.job_type)
            .execute(&mut job)
            .await
            .unwrap();

        assert_eq!(update.status, Some(JobStatus::Stored));
        assert_eq!(
            update.transaction.unwrap().enclave_key.as_deref(),
            Some("0x0102")
        );
    }

    #[tokio::test]
    async fn tessera_private_job_stores_payload_unsigned() {
        let chain = chain();
        let mut node = MockChainNodeClient::new();
        node.expect_store_raw()
            .withf(|_, payload, from| payload.to_vec() == vec![0x60, 0x80] && from.starts_with("A1a"))
            .returning(|_, _, _| Ok("c2VjcmV0".into()));
        let (senders, _) = senders(&chain, node);

        let mut job = job(&chain, JobType::TesseraPrivateTransaction);
        job.transaction.data = Some(Bytes::from(vec![0x60, 0x80]));
        let update = senders
            .sender_for(job.job_type)
            .execute(&mut job)
            .await
            .unwrap();

        assert_eq!(update.status, Some(JobStatus::Stored));
        assert_eq!(job.transaction.raw, None);
        assert_eq!(job.transaction.nonce, None);
    }

    #[tokio::test]
    async fn tessera_marking_job_targets_recipients() {
        let chain = chain();
        let mut node = MockChainNodeClient::new();
        node.expect_pending_nonce_at().returning(|_, _| Ok(1));
        node.expect_send_quorum_raw_private_transaction()
            .withf(|_, _, private_for, flag| private_for.len() == 1 && flag.is_none())
            .returning(|_, raw, _, _| Ok(H256::from(keccak256(raw))));
        let (senders, _) = senders(&chain, node);

        let mut job = job(&chain, JobType::TesseraMarkingTransaction);
        let update = senders
            .sender_for(job.job_type)
            .execute(&mut job)
            .await
            .unwrap();
        assert_eq!(update.status, Some(JobStatus::Pending));
    }
}
