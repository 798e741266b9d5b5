//! Transaction requests, schedules and jobs

use super::status::{JobStatus, StatusLog};
use crate::error::{DispatchError, DispatchResult};

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of on-chain (or private manager) submission a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    EthereumTransaction,
    EthereumRawTransaction,
    EeaPrivateTransaction,
    EeaMarkingTransaction,
    TesseraPrivateTransaction,
    TesseraMarkingTransaction,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EthereumTransaction => "ethereum_transaction",
            Self::EthereumRawTransaction => "ethereum_raw_transaction",
            Self::EeaPrivateTransaction => "eea_private_transaction",
            Self::EeaMarkingTransaction => "eea_marking_transaction",
            Self::TesseraPrivateTransaction => "tessera_private_transaction",
            Self::TesseraMarkingTransaction => "tessera_marking_transaction",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ethereum_transaction" => Ok(Self::EthereumTransaction),
            "ethereum_raw_transaction" => Ok(Self::EthereumRawTransaction),
            "eea_private_transaction" => Ok(Self::EeaPrivateTransaction),
            "eea_marking_transaction" => Ok(Self::EeaMarkingTransaction),
            "tessera_private_transaction" => Ok(Self::TesseraPrivateTransaction),
            "tessera_marking_transaction" => Ok(Self::TesseraMarkingTransaction),
            other => Err(DispatchError::InvalidFormat(format!("unknown job type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    #[default]
    Legacy,
    DynamicFee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasPriority {
    VeryLow,
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}

impl GasPriority {
    /// Fee-history reward percentile used for the priority tip
    pub fn reward_percentile(&self) -> f64 {
        match self {
            Self::VeryLow => 10.0,
            Self::Low => 25.0,
            Self::Medium => 50.0,
            Self::High => 75.0,
            Self::VeryHigh => 90.0,
        }
    }

    /// Extra percentage applied on top of a legacy gas price suggestion
    pub fn legacy_bump_percent(&self) -> u64 {
        match self {
            Self::VeryLow => 0,
            Self::Low => 5,
            Self::Medium => 10,
            Self::High => 20,
            Self::VeryHigh => 40,
        }
    }
}

/// Private transaction protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivateProtocol {
    #[serde(alias = "orion", alias = "besu")]
    Eea,
    Tessera,
    #[serde(alias = "quorum")]
    GoQuorum,
}

/// Parameters of a client transaction request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxParams {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: Option<U256>,
    pub gas: Option<U256>,
    pub gas_price: Option<U256>,
    pub gas_fee_cap: Option<U256>,
    pub gas_tip_cap: Option<U256>,
    pub transaction_type: Option<TxType>,
    pub data: Option<Bytes>,
    /// Human readable method, e.g. `transfer(address,uint256)`
    pub method_signature: Option<String>,
    pub args: Vec<String>,
    pub raw: Option<Bytes>,
    pub protocol: Option<PrivateProtocol>,
    pub private_from: Option<String>,
    pub private_for: Vec<String>,
    pub privacy_group_id: Option<String>,
    pub privacy_flag: Option<i32>,
    pub priority: GasPriority,
    pub one_time_key: bool,
}

impl TxParams {
    /// Shape checks that do not need any collaborator
    pub fn validate(&self) -> DispatchResult<()> {
        if self.raw.is_some() {
            if self.data.is_some() || self.method_signature.is_some() || self.protocol.is_some() {
                return Err(DispatchError::InvalidParameter(
                    "raw transactions cannot carry data, method or private fields".into(),
                ));
            }
            return Ok(());
        }

        if self.data.is_some() && self.method_signature.is_some() {
            return Err(DispatchError::InvalidParameter(
                "data and method_signature are mutually exclusive".into(),
            ));
        }
        if self.one_time_key && self.from.is_some() {
            return Err(DispatchError::InvalidParameter(
                "one-time-key transactions must not set from".into(),
            ));
        }
        if !self.one_time_key && self.from.is_none() {
            return Err(DispatchError::InvalidParameter("from is required".into()));
        }
        if self.gas_price.is_some() && (self.gas_fee_cap.is_some() || self.gas_tip_cap.is_some()) {
            return Err(DispatchError::InvalidParameter(
                "gas_price cannot be combined with dynamic fee caps".into(),
            ));
        }

        if let Some(protocol) = self.protocol {
            if self.private_from.is_none() {
                return Err(DispatchError::InvalidParameter(
                    "private_from is required for private transactions".into(),
                ));
            }
            let has_group = self.privacy_group_id.is_some();
            let has_recipients = !self.private_for.is_empty();
            match protocol {
                PrivateProtocol::Eea if has_group == has_recipients => {
                    return Err(DispatchError::InvalidParameter(
                        "EEA transactions need exactly one of private_for or privacy_group_id"
                            .into(),
                    ));
                }
                PrivateProtocol::Tessera | PrivateProtocol::GoQuorum if !has_recipients => {
                    return Err(DispatchError::InvalidParameter(
                        "private_for is required for Tessera transactions".into(),
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Content hash over the target chain and normalized parameters
    pub fn content_hash(&self, chain_uuid: Uuid) -> DispatchResult<String> {
        let mut normalized = self.clone();
        normalized.private_for.sort();

        let payload = serde_json::to_vec(&serde_json::json!({
            "chain_uuid": chain_uuid,
            "params": normalized,
        }))?;
        Ok(keccak_hex(&payload))
    }
}

/// A client-submitted transaction intent, immutable once accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRequest {
    pub uuid: Uuid,
    pub idempotency_key: String,
    pub tenant_id: String,
    pub chain_name: String,
    pub schedule_uuid: Uuid,
    pub request_hash: String,
    pub params: TxParams,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Mutable transaction payload of a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EthTransaction {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: Option<U256>,
    pub gas: Option<U256>,
    pub gas_price: Option<U256>,
    pub gas_fee_cap: Option<U256>,
    pub gas_tip_cap: Option<U256>,
    pub tx_type: TxType,
    pub nonce: Option<u64>,
    pub data: Option<Bytes>,
    pub raw: Option<Bytes>,
    pub hash: Option<H256>,
    pub private_from: Option<String>,
    pub private_for: Vec<String>,
    pub privacy_group_id: Option<String>,
    pub privacy_flag: Option<i32>,
    pub enclave_key: Option<String>,
}

impl EthTransaction {
    /// Forget everything computed by crafting and signing for the nonce
    pub fn reset_signature(&mut self) {
        self.nonce = None;
        self.hash = None;
        self.raw = None;
    }

    pub fn has_fee_fields(&self) -> bool {
        match self.tx_type {
            TxType::Legacy => self.gas_price.is_some(),
            TxType::DynamicFee => self.gas_fee_cap.is_some() && self.gas_tip_cap.is_some(),
        }
    }
}

/// Internal annotations carried with a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalData {
    pub one_time_key: bool,
    pub chain_id: u64,
    /// Set to the job's own uuid on a resend message
    pub parent_job_uuid: Option<Uuid>,
    pub priority: GasPriority,
    /// Funding jobs run beside the main chain of jobs, never before a successor
    pub funding: bool,
    /// Nonce recoveries spent since the job last reached the node
    pub recovery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub uuid: Uuid,
    pub schedule_uuid: Uuid,
    pub chain_uuid: Uuid,
    pub tenant_id: String,
    /// Index of the job in its schedule
    pub position: u32,
    pub job_type: JobType,
    pub transaction: EthTransaction,
    pub internal: InternalData,
    pub labels: BTreeMap<String, String>,
    pub logs: Vec<StatusLog>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        schedule_uuid: Uuid,
        chain_uuid: Uuid,
        tenant_id: &str,
        job_type: JobType,
        transaction: EthTransaction,
        internal: InternalData,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            schedule_uuid,
            chain_uuid,
            tenant_id: tenant_id.to_string(),
            position: 0,
            job_type,
            transaction,
            internal,
            labels: BTreeMap::new(),
            logs: vec![StatusLog::new(JobStatus::Created, None)],
            created_at: now,
            updated_at: now,
        }
    }

    /// Current status, projected from the last log entry
    pub fn status(&self) -> JobStatus {
        self.logs
            .last()
            .map(|log| log.status)
            .unwrap_or(JobStatus::Created)
    }

    pub fn last_message(&self) -> Option<&str> {
        self.logs.last().and_then(|log| log.message.as_deref())
    }

    /// A resend message carries the job as its own parent
    pub fn is_self_resend(&self) -> bool {
        self.internal.parent_job_uuid == Some(self.uuid)
    }

    /// Nonce partition of the job, `None` when the job does not consume a nonce
    pub fn partition_key(&self) -> Option<String> {
        if self.internal.one_time_key {
            return None;
        }
        let from = self.transaction.from?;
        let chain_id = self.internal.chain_id;
        match self.job_type {
            JobType::EthereumRawTransaction | JobType::TesseraPrivateTransaction => None,
            JobType::EeaPrivateTransaction => {
                let group = match &self.transaction.privacy_group_id {
                    Some(group) => group.clone(),
                    None => {
                        let mut recipients = self.transaction.private_for.clone();
                        recipients.sort();
                        let seed = format!(
                            "{}{}",
                            self.transaction.private_from.as_deref().unwrap_or_default(),
                            recipients.join("")
                        );
                        keccak_hex(seed.as_bytes())
                    }
                };
                Some(format!("{from:?}@eea-{group}@{chain_id}"))
            }
            _ => Some(format!("{from:?}@{chain_id}")),
        }
    }

    /// Take status history from a freshly persisted copy of this job
    pub fn sync_logs(&mut self, persisted: &Job) {
        self.logs = persisted.logs.clone();
        self.updated_at = persisted.updated_at;
    }
}

/// Ordered group of jobs fulfilling one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub uuid: Uuid,
    pub tenant_id: String,
    pub chain_uuid: Uuid,
    pub jobs: Vec<Job>,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(tenant_id: &str, chain_uuid: Uuid) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            chain_uuid,
            jobs: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Append a job, assigning its position
    pub fn push_job(&mut self, mut job: Job) {
        job.schedule_uuid = self.uuid;
        job.position = self.jobs.len() as u32;
        self.jobs.push(job);
    }

    /// First job of the main chain (funding jobs excluded)
    pub fn first_job(&self) -> Option<&Job> {
        self.jobs.iter().find(|job| !job.internal.funding)
    }

    pub fn funding_job(&self) -> Option<&Job> {
        self.jobs.iter().find(|job| job.internal.funding)
    }

    /// Successor of `job` in the main chain
    pub fn next_job_after(&self, job: &Job) -> Option<&Job> {
        if job.internal.funding {
            return None;
        }
        self.jobs
            .iter()
            .filter(|candidate| !candidate.internal.funding)
            .find(|candidate| candidate.position > job.position)
    }

    pub fn is_terminal(&self) -> bool {
        self.jobs
            .iter()
            .filter(|job| !job.internal.funding)
            .last()
            .map(|job| job.status().is_terminal())
            .unwrap_or(false)
    }
}

pub fn keccak_hex(bytes: &[u8]) -> String {
    hex::encode(Keccak256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Address {
        "0x7e654d251da770a068413677967f6d3ea2fea9e4".parse().unwrap()
    }

    fn job(job_type: JobType) -> Job {
        let tx = EthTransaction {
            from: Some(sender()),
            private_from: Some("A1aVtMxLCUHmBVHXoZzzBgPbW/wj5axDpW9X8l91SGo=".into()),
            private_for: vec!["Ko2bVqD+nNlNYL5EE7y3IdOnviftjiizpjRt+HTuFBs=".into()],
            ..Default::default()
        };
        let internal = InternalData {
            chain_id: 888,
            ..Default::default()
        };
        Job::new(Uuid::new_v4(), Uuid::new_v4(), "tenant", job_type, tx, internal)
    }

    #[test]
    fn new_job_is_created() {
        let job = job(JobType::EthereumTransaction);
        assert_eq!(job.status(), JobStatus::Created);
        assert!(!job.is_self_resend());
    }

    #[test]
    fn partition_keys_split_public_and_private_streams() {
        let public = job(JobType::EthereumTransaction).partition_key().unwrap();
        let marking = job(JobType::EeaMarkingTransaction).partition_key().unwrap();
        let private = job(JobType::EeaPrivateTransaction).partition_key().unwrap();

        assert_eq!(public, format!("{:?}@888", sender()));
        assert_eq!(public, marking);
        assert!(private.contains("@eea-"));
        assert_ne!(public, private);

        assert!(job(JobType::EthereumRawTransaction).partition_key().is_none());
        assert!(job(JobType::TesseraPrivateTransaction).partition_key().is_none());
    }

    #[test]
    fn privacy_group_names_the_partition() {
        let mut job = job(JobType::EeaPrivateTransaction);
        job.transaction.privacy_group_id = Some("group-1".into());
        assert!(job.partition_key().unwrap().contains("@eea-group-1@"));
    }

    #[test]
    fn content_hash_ignores_recipient_order() {
        let chain = Uuid::new_v4();
        let mut a = TxParams {
            from: Some(sender()),
            private_for: vec!["b".into(), "a".into()],
            ..Default::default()
        };
        let b = TxParams {
            private_for: vec!["a".into(), "b".into()],
            ..a.clone()
        };
        assert_eq!(a.content_hash(chain).unwrap(), b.content_hash(chain).unwrap());

        a.value = Some(U256::from(1));
        assert_ne!(a.content_hash(chain).unwrap(), b.content_hash(chain).unwrap());
        assert_ne!(
            b.content_hash(chain).unwrap(),
            b.content_hash(Uuid::new_v4()).unwrap()
        );
    }

    #[test]
    fn validate_rejects_conflicting_fields() {
        let base = TxParams {
            from: Some(sender()),
            ..Default::default()
        };
        assert!(base.validate().is_ok());

        let raw_with_data = TxParams {
            raw: Some(Bytes::from(vec![1u8])),
            data: Some(Bytes::from(vec![2u8])),
            ..Default::default()
        };
        assert!(raw_with_data.validate().is_err());

        let eea_without_recipients = TxParams {
            protocol: Some(PrivateProtocol::Eea),
            private_from: Some("key".into()),
            ..base.clone()
        };
        assert!(matches!(
            eea_without_recipients.validate(),
            Err(DispatchError::InvalidParameter(_))
        ));

        let missing_from = TxParams::default();
        assert!(missing_from.validate().is_err());
    }

    #[test]
    fn next_job_skips_funding() {
        let chain = Uuid::new_v4();
        let mut schedule = Schedule::new("tenant", chain);
        let mut funding = job(JobType::EthereumTransaction);
        funding.internal.funding = true;
        schedule.push_job(funding);
        schedule.push_job(job(JobType::EeaPrivateTransaction));
        schedule.push_job(job(JobType::EeaMarkingTransaction));

        let first = schedule.first_job().unwrap();
        assert_eq!(first.job_type, JobType::EeaPrivateTransaction);
        let next = schedule.next_job_after(first).unwrap();
        assert_eq!(next.job_type, JobType::EeaMarkingTransaction);
        assert!(schedule.next_job_after(next).is_none());
        assert!(schedule.next_job_after(schedule.funding_job().unwrap()).is_none());
        assert!(!schedule.is_terminal());
    }
}
