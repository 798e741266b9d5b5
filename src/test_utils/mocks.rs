//! Mock collaborators for testing.

use async_trait::async_trait;
use base64::Engine;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, FeeHistory, H256, U256};
use ethers::utils::keccak256;
use ethers::utils::rlp::Rlp;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::chain::{Chain, ChainNodeClient};
use crate::dispatch::{JobEnvelope, JobPublisher};
use crate::error::{DispatchError, DispatchResult};
use crate::job::{Job, Schedule, TxRequest};
use crate::state::{JobStore, JobUpdate};

/// A public transaction accepted by [`MockNodeClient`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentTransaction {
    pub from: Address,
    pub nonce: u64,
    pub hash: H256,
}

#[derive(Default)]
struct NodeState {
    /// Next nonce the node accepts per account
    pending: HashMap<Address, u64>,
    sent: Vec<SentTransaction>,
    /// Raw bytes of every decodable broadcast, failed ones included
    attempts: Vec<Bytes>,
    known: HashSet<H256>,
    /// Errors returned by the next broadcasts, oldest first
    broadcast_failures: VecDeque<DispatchError>,
    private_nonce: u64,
    distributed: Vec<Bytes>,
    stored_payloads: Vec<(Bytes, String)>,
    quorum_private: Vec<(Bytes, Vec<String>)>,
}

/// In-memory chain node.
///
/// Public broadcasts are decoded and must carry exactly the sender's next nonce:
/// a lower nonce is rejected with "nonce too low", a higher one as a gap.
pub struct MockNodeClient {
    state: Mutex<NodeState>,
    gas_price: U256,
    broadcast_delay: Mutex<Option<Duration>>,
    reachable: AtomicBool,
}

impl MockNodeClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NodeState::default()),
            gas_price: U256::from(1_000_000_000u64),
            broadcast_delay: Mutex::new(None),
            reachable: AtomicBool::new(true),
        }
    }

    /// Set the pending nonce of an account, as if other transactions were mined
    pub fn set_pending_nonce(&self, account: Address, nonce: u64) {
        self.state.lock().unwrap().pending.insert(account, nonce);
    }

    pub fn pending_nonce(&self, account: Address) -> u64 {
        self.state
            .lock()
            .unwrap()
            .pending
            .get(&account)
            .copied()
            .unwrap_or(0)
    }

    /// Queue an error for the next broadcast
    pub fn fail_next_broadcast(&self, err: DispatchError) {
        self.state.lock().unwrap().broadcast_failures.push_back(err);
    }

    /// Make every call fail with a connection error
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay each public broadcast, to observe in-flight sends
    pub fn set_broadcast_delay(&self, delay: Duration) {
        *self.broadcast_delay.lock().unwrap() = Some(delay);
    }

    /// Public transactions accepted so far, in acceptance order
    pub fn sent(&self) -> Vec<SentTransaction> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn broadcast_attempts(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn sent_nonces(&self, account: Address) -> Vec<u64> {
        self.sent()
            .into_iter()
            .filter(|tx| tx.from == account)
            .map(|tx| tx.nonce)
            .collect()
    }

    pub fn distributed(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().distributed.clone()
    }

    pub fn stored_payloads(&self) -> Vec<(Bytes, String)> {
        self.state.lock().unwrap().stored_payloads.clone()
    }

    pub fn quorum_private(&self) -> Vec<(Bytes, Vec<String>)> {
        self.state.lock().unwrap().quorum_private.clone()
    }

    fn check_reachable(&self) -> DispatchResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DispatchError::Connection("mock node unreachable".into()))
        }
    }

    fn enclave_key(payload: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(keccak256(payload))
    }
}

impl Default for MockNodeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainNodeClient for MockNodeClient {
    async fn pending_nonce_at(&self, _chain: &Chain, account: Address) -> DispatchResult<u64> {
        self.check_reachable()?;
        Ok(self.pending_nonce(account))
    }

    async fn priv_nonce(
        &self,
        _chain: &Chain,
        _account: Address,
        _privacy_group_id: &str,
    ) -> DispatchResult<u64> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().private_nonce)
    }

    async fn priv_eea_nonce(
        &self,
        _chain: &Chain,
        _account: Address,
        _private_from: &str,
        _private_for: &[String],
    ) -> DispatchResult<u64> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().private_nonce)
    }

    async fn suggest_gas_price(&self, _chain: &Chain) -> DispatchResult<U256> {
        self.check_reachable()?;
        Ok(self.gas_price)
    }

    async fn fee_history(
        &self,
        _chain: &Chain,
        _block_count: u64,
        _reward_percentiles: &[f64],
    ) -> DispatchResult<FeeHistory> {
        self.check_reachable()?;
        Ok(FeeHistory {
            base_fee_per_gas: vec![self.gas_price, self.gas_price],
            gas_used_ratio: vec![0.5],
            oldest_block: U256::one(),
            reward: vec![vec![U256::from(1_000_000u64)]],
        })
    }

    async fn estimate_gas(&self, _chain: &Chain, _tx: &TypedTransaction) -> DispatchResult<U256> {
        self.check_reachable()?;
        Ok(U256::from(21_000u64))
    }

    async fn send_raw_transaction(&self, _chain: &Chain, raw: &Bytes) -> DispatchResult<H256> {
        self.check_reachable()?;
        let delay = *self.broadcast_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (decoded, signature) = TypedTransaction::decode_signed(&Rlp::new(raw))
            .map_err(|e| DispatchError::Encoding(format!("cannot decode transaction: {e}")))?;
        let from = signature
            .recover(decoded.sighash())
            .map_err(|e| DispatchError::Encoding(format!("cannot recover sender: {e}")))?;
        let nonce = decoded.nonce().map(|n| n.as_u64()).unwrap_or_default();
        let hash = H256::from(keccak256(raw));

        let mut state = self.state.lock().unwrap();
        state.attempts.push(raw.clone());
        if let Some(err) = state.broadcast_failures.pop_front() {
            return Err(err);
        }
        if state.known.contains(&hash) {
            return Err(DispatchError::KnownTransaction("already known".into()));
        }

        let expected = state.pending.get(&from).copied().unwrap_or(0);
        if nonce < expected {
            return Err(DispatchError::NodeRejected("nonce too low".into()));
        }
        if nonce > expected {
            return Err(DispatchError::NodeRejected(format!(
                "nonce gap: got {nonce}, next is {expected}"
            )));
        }

        state.pending.insert(from, expected + 1);
        state.known.insert(hash);
        state.sent.push(SentTransaction { from, nonce, hash });
        Ok(hash)
    }

    async fn priv_distribute_raw_transaction(
        &self,
        _chain: &Chain,
        raw: &Bytes,
    ) -> DispatchResult<String> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.private_nonce += 1;
        state.distributed.push(raw.clone());
        Ok(Self::enclave_key(raw))
    }

    async fn send_quorum_raw_private_transaction(
        &self,
        _chain: &Chain,
        raw: &Bytes,
        private_for: &[String],
        _privacy_flag: Option<i32>,
    ) -> DispatchResult<H256> {
        self.check_reachable()?;
        self.state
            .lock()
            .unwrap()
            .quorum_private
            .push((raw.clone(), private_for.to_vec()));
        Ok(H256::from(keccak256(raw)))
    }

    async fn store_raw(
        &self,
        _chain: &Chain,
        payload: &Bytes,
        private_from: &str,
    ) -> DispatchResult<String> {
        self.check_reachable()?;
        self.state
            .lock()
            .unwrap()
            .stored_payloads
            .push((payload.clone(), private_from.to_string()));
        Ok(Self::enclave_key(payload))
    }
}

/// Publisher recording envelopes instead of delivering them
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<JobEnvelope>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<JobEnvelope> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobPublisher for RecordingPublisher {
    async fn publish(&self, envelope: &JobEnvelope) -> DispatchResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DispatchError::Connection("mock transport down".into()));
        }
        self.published.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

/// Store wrapper failing a configurable number of job updates
pub struct FlakyStore {
    inner: Arc<dyn JobStore>,
    update_failures: Mutex<VecDeque<DispatchError>>,
    read_failures: Mutex<VecDeque<DispatchError>>,
    healthy: AtomicBool,
    updates: Mutex<Vec<(Uuid, JobUpdate)>>,
}

impl FlakyStore {
    #[must_use]
    pub fn new(inner: Arc<dyn JobStore>) -> Self {
        Self {
            inner,
            update_failures: Mutex::new(VecDeque::new()),
            read_failures: Mutex::new(VecDeque::new()),
            healthy: AtomicBool::new(true),
            updates: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `count` job updates with `err`
    pub fn fail_updates(&self, count: usize, err: DispatchError) {
        let mut failures = self.update_failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(err.clone());
        }
    }

    /// Fail the next `count` job reads with `err`
    pub fn fail_reads(&self, count: usize, err: DispatchError) {
        let mut failures = self.read_failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(err.clone());
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Updates that reached the inner store
    pub fn applied_updates(&self) -> Vec<(Uuid, JobUpdate)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn health_check(&self) -> DispatchResult<()> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(DispatchError::Connection("store unavailable".into()));
        }
        self.inner.health_check().await
    }

    async fn find_tx_request(
        &self,
        idempotency_key: &str,
        tenant_id: &str,
    ) -> DispatchResult<Option<TxRequest>> {
        self.inner.find_tx_request(idempotency_key, tenant_id).await
    }

    async fn insert_schedule(&self, request: &TxRequest, schedule: &Schedule) -> DispatchResult<()> {
        self.inner.insert_schedule(request, schedule).await
    }

    async fn get_schedule(&self, uuid: Uuid, tenant_id: &str) -> DispatchResult<Schedule> {
        self.inner.get_schedule(uuid, tenant_id).await
    }

    async fn get_job(&self, uuid: Uuid, tenant_id: &str) -> DispatchResult<Job> {
        let failure = self.read_failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.inner.get_job(uuid, tenant_id).await
    }

    async fn insert_job(&self, job: &Job) -> DispatchResult<Job> {
        self.inner.insert_job(job).await
    }

    async fn update_job(
        &self,
        uuid: Uuid,
        tenant_id: &str,
        update: &JobUpdate,
    ) -> DispatchResult<Job> {
        let failure = self.update_failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        let job = self.inner.update_job(uuid, tenant_id, update).await?;
        self.updates.lock().unwrap().push((uuid, update.clone()));
        Ok(job)
    }
}
