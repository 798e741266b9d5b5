//! Add a job to an existing schedule

use crate::chain::ChainRegistry;
use crate::error::{DispatchError, DispatchResult};
use crate::job::{EthTransaction, InternalData, Job, JobType};
use crate::state::JobStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Job to append to a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub schedule_uuid: Uuid,
    pub chain_uuid: Uuid,
    pub job_type: JobType,
    pub transaction: EthTransaction,
    #[serde(default)]
    pub internal: InternalData,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

pub struct CreateJobUseCase {
    store: Arc<dyn JobStore>,
    registry: Arc<dyn ChainRegistry>,
}

impl CreateJobUseCase {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<dyn ChainRegistry>) -> Self {
        Self { store, registry }
    }

    #[instrument(skip(self, new_job), fields(schedule_uuid = %new_job.schedule_uuid))]
    pub async fn execute(&self, new_job: NewJob, tenant_id: &str) -> DispatchResult<Job> {
        let chain = self
            .registry
            .get_chain(tenant_id, new_job.chain_uuid)
            .await
            .map_err(|e| e.in_component("create-job"))?;

        let schedule = self
            .store
            .get_schedule(new_job.schedule_uuid, tenant_id)
            .await
            .map_err(|e| e.in_component("create-job"))?;
        if schedule.chain_uuid != chain.uuid {
            return Err(DispatchError::InvalidParameter(format!(
                "schedule {} runs on another chain",
                schedule.uuid
            )));
        }

        let mut internal = new_job.internal;
        internal.chain_id = chain.chain_id;

        let mut job = Job::new(
            schedule.uuid,
            chain.uuid,
            tenant_id,
            new_job.job_type,
            new_job.transaction,
            internal,
        );
        job.labels = new_job.labels;

        let job = self
            .store
            .insert_job(&job)
            .await
            .map_err(|e| e.in_component("create-job"))?;
        info!(job_uuid = %job.uuid, position = job.position, "Job created");
        Ok(job)
    }
}
