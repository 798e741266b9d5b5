//! Send-transaction use case: idempotent request to schedule materialization

use super::start::StartJobUseCase;
use crate::chain::{Chain, ChainRegistry};
use crate::error::{DispatchError, DispatchResult};
use crate::job::{
    EthTransaction, InternalData, Job, JobStatus, JobType, PrivateProtocol, Schedule, TxParams,
    TxRequest, TxType,
};
use crate::metrics;
use crate::state::JobStore;

use chrono::Utc;
use ethers::abi::token::{LenientTokenizer, Tokenizer};
use ethers::abi::{AbiParser, Token};
use ethers::types::{Bytes, H256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Client request as received from the (external) controller layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendTxRequest {
    /// Generated when empty
    pub idempotency_key: Option<String>,
    pub chain_name: String,
    pub params: TxParams,
    pub labels: BTreeMap<String, String>,
}

/// Result of [`SendTxUseCase::execute`]
#[derive(Debug)]
pub struct SendOutcome {
    pub schedule: Schedule,
    /// The schedule is persisted even when starting its first job failed
    pub start_error: Option<DispatchError>,
}

/// ABI-encode a call from a human readable signature and string arguments
pub fn encode_method_call(signature: &str, args: &[String]) -> DispatchResult<Bytes> {
    let signature = signature.trim();
    let source = if signature.starts_with("function ") {
        signature.to_string()
    } else {
        format!("function {signature}")
    };
    let function = AbiParser::default()
        .parse_function(&source)
        .map_err(|e| DispatchError::InvalidFormat(format!("method signature {signature}: {e}")))?;

    if function.inputs.len() != args.len() {
        return Err(DispatchError::InvalidParameter(format!(
            "{} expects {} arguments, got {}",
            function.name,
            function.inputs.len(),
            args.len()
        )));
    }

    let tokens = function
        .inputs
        .iter()
        .zip(args)
        .map(|(param, arg)| {
            LenientTokenizer::tokenize(&param.kind, arg).map_err(|e| {
                DispatchError::InvalidFormat(format!("argument {} ({}): {}", param.name, arg, e))
            })
        })
        .collect::<DispatchResult<Vec<Token>>>()?;

    let encoded = function
        .encode_input(&tokens)
        .map_err(|e| DispatchError::InvalidFormat(format!("encoding {}: {}", function.name, e)))?;
    Ok(Bytes::from(encoded))
}

pub struct SendTxUseCase {
    registry: Arc<dyn ChainRegistry>,
    store: Arc<dyn JobStore>,
    starter: Arc<StartJobUseCase>,
}

impl SendTxUseCase {
    pub fn new(
        registry: Arc<dyn ChainRegistry>,
        store: Arc<dyn JobStore>,
        starter: Arc<StartJobUseCase>,
    ) -> Self {
        Self {
            registry,
            store,
            starter,
        }
    }

    #[instrument(skip(self, request), fields(chain = %request.chain_name))]
    pub async fn execute(
        &self,
        request: SendTxRequest,
        tenant_id: &str,
    ) -> DispatchResult<SendOutcome> {
        request.params.validate()?;

        let chain = self
            .registry
            .get_chain_by_name(tenant_id, &request.chain_name)
            .await
            .map_err(|e| match e {
                DispatchError::NotFound(msg) => DispatchError::InvalidParameter(msg),
                other => other.in_component("send-tx"),
            })?;
        let request_hash = request.params.content_hash(chain.uuid)?;

        if let Some(key) = request.idempotency_key.as_deref().filter(|k| !k.is_empty()) {
            if let Some(existing) = self.store.find_tx_request(key, tenant_id).await? {
                return self.replay(&existing, &request_hash, tenant_id).await;
            }
        }

        let schedule = self.build_schedule(&chain, tenant_id, &request).await?;
        let tx_request = TxRequest {
            uuid: Uuid::new_v4(),
            idempotency_key: request
                .idempotency_key
                .clone()
                .filter(|k| !k.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            tenant_id: tenant_id.to_string(),
            chain_name: chain.name.clone(),
            schedule_uuid: schedule.uuid,
            request_hash: request_hash.clone(),
            params: request.params.clone(),
            labels: request.labels.clone(),
            created_at: Utc::now(),
        };

        match self.store.insert_schedule(&tx_request, &schedule).await {
            Ok(()) => {}
            Err(DispatchError::AlreadyExists(_)) => {
                // Lost a race against a concurrent submission with the same key
                let existing = self
                    .store
                    .find_tx_request(&tx_request.idempotency_key, tenant_id)
                    .await?
                    .ok_or_else(|| {
                        DispatchError::Internal("conflicting request vanished".into())
                    })?;
                return self.replay(&existing, &request_hash, tenant_id).await;
            }
            Err(e) => return Err(e.in_component("send-tx")),
        }

        metrics::record_schedule_created();
        info!(
            schedule_uuid = %schedule.uuid,
            jobs = schedule.jobs.len(),
            "Schedule created"
        );
        self.start(schedule, tenant_id).await
    }

    async fn replay(
        &self,
        existing: &TxRequest,
        request_hash: &str,
        tenant_id: &str,
    ) -> DispatchResult<SendOutcome> {
        if existing.request_hash != request_hash {
            return Err(DispatchError::AlreadyExists(format!(
                "a request with idempotency key {} and different parameters already exists",
                existing.idempotency_key
            )));
        }

        metrics::record_idempotent_replay();
        debug!(schedule_uuid = %existing.schedule_uuid, "Replaying existing schedule");
        let schedule = self
            .store
            .get_schedule(existing.schedule_uuid, tenant_id)
            .await?;
        self.start(schedule, tenant_id).await
    }

    /// Start the funding job and the first job when they are still CREATED
    async fn start(&self, schedule: Schedule, tenant_id: &str) -> DispatchResult<SendOutcome> {
        let to_start: Vec<Uuid> = schedule
            .funding_job()
            .into_iter()
            .chain(schedule.first_job())
            .filter(|job| job.status() == JobStatus::Created)
            .map(|job| job.uuid)
            .collect();
        if to_start.is_empty() {
            return Ok(SendOutcome {
                schedule,
                start_error: None,
            });
        }

        let mut start_error = None;
        for job_uuid in to_start {
            if let Err(e) = self.starter.execute(job_uuid, tenant_id).await {
                warn!(job_uuid = %job_uuid, "Failed to start job: {}", e);
                start_error.get_or_insert(e);
            }
        }

        let schedule = self.store.get_schedule(schedule.uuid, tenant_id).await?;
        Ok(SendOutcome {
            schedule,
            start_error,
        })
    }

    async fn build_schedule(
        &self,
        chain: &Chain,
        tenant_id: &str,
        request: &SendTxRequest,
    ) -> DispatchResult<Schedule> {
        let params = &request.params;
        let data = match &params.method_signature {
            Some(signature) => Some(encode_method_call(signature, &params.args)?),
            None => params.data.clone(),
        };

        let internal = InternalData {
            one_time_key: params.one_time_key,
            chain_id: chain.chain_id,
            priority: params.priority,
            ..Default::default()
        };
        let base = EthTransaction {
            from: params.from,
            to: params.to,
            value: params.value,
            gas: params.gas,
            gas_price: params.gas_price,
            gas_fee_cap: params.gas_fee_cap,
            gas_tip_cap: params.gas_tip_cap,
            tx_type: params.transaction_type.unwrap_or(if chain.dynamic_fees {
                TxType::DynamicFee
            } else {
                TxType::Legacy
            }),
            data,
            ..Default::default()
        };

        let mut schedule = Schedule::new(tenant_id, chain.uuid);
        let schedule_uuid = schedule.uuid;
        let new_job = |job_type: JobType, transaction: EthTransaction| {
            let mut job = Job::new(
                schedule_uuid,
                chain.uuid,
                tenant_id,
                job_type,
                transaction,
                internal.clone(),
            );
            job.labels = request.labels.clone();
            job
        };

        let mut jobs = Vec::new();
        if let Some(raw) = &params.raw {
            let transaction = EthTransaction {
                raw: Some(raw.clone()),
                hash: Some(H256::from(keccak256(raw))),
                ..Default::default()
            };
            jobs.push(new_job(JobType::EthereumRawTransaction, transaction));
        } else if let Some(protocol) = params.protocol {
            let private = EthTransaction {
                private_from: params.private_from.clone(),
                private_for: params.private_for.clone(),
                privacy_group_id: params.privacy_group_id.clone(),
                privacy_flag: params.privacy_flag,
                ..base.clone()
            };
            match protocol {
                PrivateProtocol::Eea => {
                    let precompile = chain.privacy_precompile.ok_or_else(|| {
                        DispatchError::InvalidParameter(format!(
                            "chain {} has no privacy precompile",
                            chain.name
                        ))
                    })?;
                    let marking = EthTransaction {
                        from: params.from,
                        to: Some(precompile),
                        tx_type: TxType::Legacy,
                        gas_price: params.gas_price,
                        ..Default::default()
                    };
                    jobs.push(new_job(JobType::EeaPrivateTransaction, private));
                    jobs.push(new_job(JobType::EeaMarkingTransaction, marking));
                }
                PrivateProtocol::Tessera | PrivateProtocol::GoQuorum => {
                    if chain.private_tx_manager_url.is_none() {
                        return Err(DispatchError::InvalidParameter(format!(
                            "chain {} has no private transaction manager",
                            chain.name
                        )));
                    }
                    let marking = EthTransaction {
                        from: params.from,
                        to: params.to,
                        value: params.value,
                        gas: params.gas,
                        gas_price: params.gas_price,
                        tx_type: TxType::Legacy,
                        private_for: params.private_for.clone(),
                        privacy_flag: params.privacy_flag,
                        ..Default::default()
                    };
                    jobs.push(new_job(JobType::TesseraPrivateTransaction, private));
                    jobs.push(new_job(JobType::TesseraMarkingTransaction, marking));
                }
            }
        } else {
            jobs.push(new_job(JobType::EthereumTransaction, base));
        }

        if let Some(mut funding) = self.funding_job(chain, tenant_id, params, &internal).await? {
            funding.labels = request.labels.clone();
            schedule.push_job(funding);
        }
        for job in jobs {
            schedule.push_job(job);
        }
        Ok(schedule)
    }

    async fn funding_job(
        &self,
        chain: &Chain,
        tenant_id: &str,
        params: &TxParams,
        internal: &InternalData,
    ) -> DispatchResult<Option<Job>> {
        let Some(account) = params.from else {
            return Ok(None);
        };
        if params.one_time_key || params.raw.is_some() {
            return Ok(None);
        }
        let Some(faucet) = self.registry.get_faucet_candidate(account, chain).await? else {
            return Ok(None);
        };

        debug!(faucet = %faucet.uuid, account = ?account, "Funding account from faucet");
        let transaction = EthTransaction {
            from: Some(faucet.creditor),
            to: Some(account),
            value: Some(faucet.amount),
            tx_type: if chain.dynamic_fees {
                TxType::DynamicFee
            } else {
                TxType::Legacy
            },
            ..Default::default()
        };
        Ok(Some(Job::new(
            Uuid::nil(),
            chain.uuid,
            tenant_id,
            JobType::EthereumTransaction,
            transaction,
            InternalData {
                funding: true,
                one_time_key: false,
                parent_job_uuid: None,
                ..internal.clone()
            },
        )))
    }
}
