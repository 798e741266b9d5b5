//! Transaction signing
//!
//! The key manager only produces signatures. Assembling the signed raw
//! transaction for each protocol happens here.

use super::crafter::to_typed_transaction;
use crate::error::{DispatchError, DispatchResult};
use crate::job::{EthTransaction, Job, JobType};

use async_trait::async_trait;
use base64::Engine;
use ethers::core::rand::thread_rng;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::keccak256;
use ethers::utils::rlp::RlpStream;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Privacy restriction carried by EEA transactions
const EEA_RESTRICTION: &str = "restricted";

/// Offset added to `v` by GoQuorum for private transactions
const QUORUM_PRIVATE_V_OFFSET: u64 = 10;

/// Private recipients of an EEA transaction
#[derive(Debug, Clone, PartialEq)]
pub enum EeaRecipients {
    PrivateFor(Vec<Vec<u8>>),
    PrivacyGroup(Vec<u8>),
}

/// EEA private transaction fields in their RLP form
#[derive(Debug, Clone, PartialEq)]
pub struct EeaTransaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas: U256,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub chain_id: u64,
    pub private_from: Vec<u8>,
    pub recipients: EeaRecipients,
}

impl EeaTransaction {
    pub fn from_eth_transaction(tx: &EthTransaction, chain_id: u64) -> DispatchResult<Self> {
        let private_from = tx
            .private_from
            .as_deref()
            .ok_or_else(|| DispatchError::InvalidParameter("EEA job has no private_from".into()))?;

        let recipients = match &tx.privacy_group_id {
            Some(group) => EeaRecipients::PrivacyGroup(decode_enclave_key(group)?),
            None => EeaRecipients::PrivateFor(
                tx.private_for
                    .iter()
                    .map(|key| decode_enclave_key(key))
                    .collect::<DispatchResult<_>>()?,
            ),
        };

        Ok(Self {
            nonce: tx
                .nonce
                .ok_or_else(|| DispatchError::InvalidState("EEA job was not crafted".into()))?,
            gas_price: tx.gas_price.unwrap_or_default(),
            gas: tx.gas.unwrap_or_default(),
            to: tx.to,
            value: tx.value.unwrap_or_default(),
            data: tx.data.clone().unwrap_or_default(),
            chain_id,
            private_from: decode_enclave_key(private_from)?,
            recipients,
        })
    }

    fn append_common(&self, stream: &mut RlpStream) {
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas);
        match self.to {
            Some(to) => stream.append(&to),
            None => stream.append_empty_data(),
        };
        stream.append(&self.value);
        stream.append(&self.data.to_vec());
    }

    fn append_private(&self, stream: &mut RlpStream) {
        stream.append(&self.private_from);
        match &self.recipients {
            EeaRecipients::PrivateFor(keys) => {
                stream.begin_list(keys.len());
                for key in keys {
                    stream.append(key);
                }
            }
            EeaRecipients::PrivacyGroup(group) => {
                stream.append(group);
            }
        }
        stream.append(&EEA_RESTRICTION.as_bytes().to_vec());
    }

    /// Hash signed by the key manager (EIP-155 style with chain id, 0, 0)
    pub fn sighash(&self) -> H256 {
        let mut stream = RlpStream::new_list(12);
        self.append_common(&mut stream);
        stream.append(&self.chain_id);
        stream.append(&0u8);
        stream.append(&0u8);
        self.append_private(&mut stream);
        H256::from(keccak256(stream.out()))
    }

    pub fn rlp_signed(&self, signature: &Signature) -> Bytes {
        let mut stream = RlpStream::new_list(12);
        self.append_common(&mut stream);
        stream.append(&signature.v);
        stream.append(&signature.r);
        stream.append(&signature.s);
        self.append_private(&mut stream);
        stream.out().freeze().into()
    }
}

/// Enclave keys travel as base64, or hex when prefixed with `0x`
pub fn decode_enclave_key(key: &str) -> DispatchResult<Vec<u8>> {
    if let Some(stripped) = key.strip_prefix("0x") {
        return hex::decode(stripped)
            .map_err(|e| DispatchError::InvalidFormat(format!("enclave key {key}: {e}")));
    }
    base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|e| DispatchError::InvalidFormat(format!("enclave key {key}: {e}")))
}

/// Transaction handed to the key manager
#[derive(Debug, Clone)]
pub enum SignableTransaction {
    /// Public transaction, EIP-155 / EIP-1559 signature
    Ethereum(TypedTransaction),
    /// EEA private transaction
    Eea(EeaTransaction),
    /// GoQuorum private transaction, signed without chain id
    QuorumPrivate(TypedTransaction),
}

/// Remote signing collaborator
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Signature of `tx` by `signer`, `v` already in its final encoding
    async fn sign_transaction(
        &self,
        signer: Address,
        tx: &SignableTransaction,
    ) -> DispatchResult<Signature>;
}

/// Key manager over locally held keys
pub struct LocalKeyManager {
    wallets: HashMap<Address, LocalWallet>,
}

impl LocalKeyManager {
    pub fn new(wallets: Vec<LocalWallet>) -> Self {
        Self {
            wallets: wallets.into_iter().map(|w| (w.address(), w)).collect(),
        }
    }

    /// Load comma separated hex keys from an environment variable
    pub fn from_env(var: &str) -> DispatchResult<Self> {
        let keys = std::env::var(var).map_err(|_| {
            DispatchError::Config(format!("No signing keys configured. Set {var}"))
        })?;

        let wallets = keys
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(|key| {
                key.parse::<LocalWallet>()
                    .map_err(|e| DispatchError::Config(format!("Invalid private key: {e}")))
            })
            .collect::<DispatchResult<Vec<_>>>()?;

        let manager = Self::new(wallets);
        info!("Key manager loaded {} signing keys", manager.wallets.len());
        Ok(manager)
    }

    pub fn accounts(&self) -> Vec<Address> {
        self.wallets.keys().copied().collect()
    }

    fn wallet(&self, signer: Address) -> DispatchResult<&LocalWallet> {
        self.wallets
            .get(&signer)
            .ok_or_else(|| DispatchError::NotFound(format!("signing key for {signer:?}")))
    }
}

/// Sign with a wallet, producing the final `v` for the transaction kind
pub fn sign_with_wallet(
    wallet: &LocalWallet,
    tx: &SignableTransaction,
) -> DispatchResult<Signature> {
    let signature = match tx {
        SignableTransaction::Ethereum(typed) => {
            let chain_id = typed.chain_id().map(|id| id.as_u64()).ok_or_else(|| {
                DispatchError::InvalidParameter("transaction has no chain id".into())
            })?;
            wallet
                .clone()
                .with_chain_id(chain_id)
                .sign_transaction_sync(typed)
                .map_err(|e| DispatchError::Encoding(format!("signing failed: {e}")))?
        }
        SignableTransaction::Eea(eea) => {
            let mut signature = wallet
                .sign_hash(eea.sighash())
                .map_err(|e| DispatchError::Encoding(format!("signing failed: {e}")))?;
            let recovery_id = signature.v - 27;
            signature.v = recovery_id + 35 + 2 * eea.chain_id;
            signature
        }
        SignableTransaction::QuorumPrivate(typed) => {
            let mut signature = wallet
                .sign_hash(typed.sighash())
                .map_err(|e| DispatchError::Encoding(format!("signing failed: {e}")))?;
            signature.v += QUORUM_PRIVATE_V_OFFSET;
            signature
        }
    };
    Ok(signature)
}

#[async_trait]
impl KeyManager for LocalKeyManager {
    async fn sign_transaction(
        &self,
        signer: Address,
        tx: &SignableTransaction,
    ) -> DispatchResult<Signature> {
        sign_with_wallet(self.wallet(signer)?, tx)
    }
}

/// Signs jobs and stores the raw transaction and its hash on them
pub struct TransactionSigner {
    key_manager: Arc<dyn KeyManager>,
}

impl TransactionSigner {
    pub fn new(key_manager: Arc<dyn KeyManager>) -> Self {
        Self { key_manager }
    }

    pub async fn sign(&self, job: &mut Job) -> DispatchResult<()> {
        let chain_id = job.internal.chain_id;

        let signable = match job.job_type {
            JobType::EthereumTransaction | JobType::EeaMarkingTransaction => {
                SignableTransaction::Ethereum(to_typed_transaction(&job.transaction, Some(chain_id)))
            }
            JobType::EeaPrivateTransaction => SignableTransaction::Eea(
                EeaTransaction::from_eth_transaction(&job.transaction, chain_id)?,
            ),
            JobType::TesseraMarkingTransaction => {
                SignableTransaction::QuorumPrivate(to_typed_transaction(&job.transaction, None))
            }
            JobType::EthereumRawTransaction | JobType::TesseraPrivateTransaction => {
                return Err(DispatchError::InvalidState(format!(
                    "{} jobs are not signed",
                    job.job_type
                )));
            }
        };

        let signature = if job.internal.one_time_key {
            let wallet = LocalWallet::new(&mut thread_rng());
            job.transaction.from = Some(wallet.address());
            sign_with_wallet(&wallet, &signable)?
        } else {
            let from = job
                .transaction
                .from
                .ok_or_else(|| DispatchError::InvalidParameter("job has no sender".into()))?;
            self.key_manager.sign_transaction(from, &signable).await?
        };

        let raw = match &signable {
            SignableTransaction::Ethereum(typed) | SignableTransaction::QuorumPrivate(typed) => {
                typed.rlp_signed(&signature)
            }
            SignableTransaction::Eea(eea) => eea.rlp_signed(&signature),
        };
        let hash = H256::from(keccak256(&raw));

        debug!(job_uuid = %job.uuid, tx_hash = ?hash, "Signed transaction");
        job.transaction.raw = Some(raw);
        job.transaction.hash = Some(hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{InternalData, TxType};
    use ethers::types::transaction::eip2718::TypedTransaction;
    use ethers::utils::rlp::Rlp;
    use uuid::Uuid;

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn wallet() -> LocalWallet {
        KEY.parse().unwrap()
    }

    fn job(job_type: JobType) -> Job {
        let tx = EthTransaction {
            from: Some(wallet().address()),
            to: Some(Address::random()),
            value: Some(U256::from(1u64)),
            gas: Some(U256::from(21_000u64)),
            gas_price: Some(U256::from(1_000_000_000u64)),
            nonce: Some(3),
            private_from: Some("A1aVtMxLCUHmBVHXoZzzBgPbW/wj5axDpW9X8l91SGo=".into()),
            private_for: vec!["Ko2bVqD+nNlNYL5EE7y3IdOnviftjiizpjRt+HTuFBs=".into()],
            ..Default::default()
        };
        Job::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "tenant",
            job_type,
            tx,
            InternalData {
                chain_id: 1337,
                ..Default::default()
            },
        )
    }

    fn signer() -> TransactionSigner {
        TransactionSigner::new(Arc::new(LocalKeyManager::new(vec![wallet()])))
    }

    #[tokio::test]
    async fn public_transaction_recovers_to_sender() {
        let mut job = job(JobType::EthereumTransaction);
        signer().sign(&mut job).await.unwrap();

        let raw = job.transaction.raw.clone().unwrap();
        let (decoded, signature) = TypedTransaction::decode_signed(&Rlp::new(&raw)).unwrap();
        assert_eq!(signature.recover(decoded.sighash()).unwrap(), wallet().address());
        assert_eq!(job.transaction.hash, Some(H256::from(keccak256(&raw))));
    }

    #[tokio::test]
    async fn dynamic_fee_transaction_is_typed() {
        let mut job = job(JobType::EthereumTransaction);
        job.transaction.tx_type = TxType::DynamicFee;
        job.transaction.gas_fee_cap = Some(U256::from(100u64));
        job.transaction.gas_tip_cap = Some(U256::from(2u64));
        signer().sign(&mut job).await.unwrap();

        assert_eq!(job.transaction.raw.unwrap()[0], 0x02);
    }

    #[tokio::test]
    async fn eea_signature_uses_chain_id_in_v() {
        let mut job = job(JobType::EeaPrivateTransaction);
        signer().sign(&mut job).await.unwrap();

        let raw = job.transaction.raw.unwrap();
        let rlp = Rlp::new(&raw);
        assert_eq!(rlp.item_count().unwrap(), 12);
        let v: u64 = rlp.val_at(6).unwrap();
        assert!(v == 35 + 2 * 1337 || v == 36 + 2 * 1337);
        let restriction: Vec<u8> = rlp.val_at(11).unwrap();
        assert_eq!(restriction, b"restricted".to_vec());
    }

    #[tokio::test]
    async fn quorum_private_signature_uses_37_or_38() {
        let mut job = job(JobType::TesseraMarkingTransaction);
        signer().sign(&mut job).await.unwrap();

        let raw = job.transaction.raw.unwrap();
        let v: u64 = Rlp::new(&raw).val_at(6).unwrap();
        assert!(v == 37 || v == 38);
    }

    #[tokio::test]
    async fn one_time_key_replaces_sender() {
        let mut job = job(JobType::EthereumTransaction);
        job.transaction.from = None;
        job.internal.one_time_key = true;
        signer().sign(&mut job).await.unwrap();

        assert!(job.transaction.from.is_some());
        assert_ne!(job.transaction.from, Some(wallet().address()));
    }

    #[tokio::test]
    async fn unknown_sender_is_not_found() {
        let mut job = job(JobType::EthereumTransaction);
        job.transaction.from = Some(Address::random());
        assert!(matches!(
            signer().sign(&mut job).await,
            Err(DispatchError::NotFound(_))
        ));
    }

    #[test]
    fn enclave_keys_decode_from_base64_or_hex() {
        assert_eq!(decode_enclave_key("0x0102").unwrap(), vec![1, 2]);
        assert_eq!(decode_enclave_key("AQI=").unwrap(), vec![1, 2]);
        assert!(decode_enclave_key("***").is_err());
    }
}
