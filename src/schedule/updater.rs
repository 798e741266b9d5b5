//! Job status updates visible to the outside world

use super::start::StartJobUseCase;
use crate::chain::ChainRegistry;
use crate::error::{DispatchError, DispatchResult};
use crate::job::{Job, JobStatus, JobType};
use crate::metrics;
use crate::state::{JobStore, JobUpdate};
use crate::tx::signer::decode_enclave_key;

use async_trait::async_trait;
use ethers::types::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The only write path for job status and log changes
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Persist `update` and sync the job's status history with the stored copy
    async fn update_job(&self, job: &mut Job, update: JobUpdate) -> DispatchResult<()>;

    /// Hand the enclave key of a STORED job to its successor and start it.
    /// Does nothing when the successor was already started.
    async fn start_next(&self, stored: &Job) -> DispatchResult<()>;
}

pub struct JobStatusUpdater {
    store: Arc<dyn JobStore>,
    registry: Arc<dyn ChainRegistry>,
    starter: Arc<StartJobUseCase>,
}

impl JobStatusUpdater {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<dyn ChainRegistry>,
        starter: Arc<StartJobUseCase>,
    ) -> Self {
        Self {
            store,
            registry,
            starter,
        }
    }
}

#[async_trait]
impl StatusSink for JobStatusUpdater {
    async fn update_job(&self, job: &mut Job, update: JobUpdate) -> DispatchResult<()> {
        let persisted = match self.store.update_job(job.uuid, &job.tenant_id, &update).await {
            Ok(persisted) => persisted,
            Err(e) => {
                metrics::record_status_update_failure();
                return Err(e.in_component("status-updater"));
            }
        };
        job.sync_logs(&persisted);

        let status = persisted.status();
        debug!(job_uuid = %job.uuid, status = %status, "Job status updated");
        match status {
            JobStatus::Failed => metrics::record_job_failed(job.job_type.as_str()),
            JobStatus::Stored => self.start_next(&persisted).await?,
            _ => {}
        }
        Ok(())
    }

    async fn start_next(&self, stored: &Job) -> DispatchResult<()> {
        let schedule = self
            .store
            .get_schedule(stored.schedule_uuid, &stored.tenant_id)
            .await?;
        let Some(next) = schedule.next_job_after(stored) else {
            return Ok(());
        };
        if next.status() != JobStatus::Created {
            debug!(job_uuid = %next.uuid, "Next job already started");
            return Ok(());
        }

        let key = stored.transaction.enclave_key.as_deref().ok_or_else(|| {
            DispatchError::InvalidState(format!("stored job {} has no enclave key", stored.uuid))
        })?;

        let mut transaction = next.transaction.clone();
        transaction.data = Some(Bytes::from(decode_enclave_key(key)?));
        match next.job_type {
            JobType::EeaMarkingTransaction => {
                let chain = self
                    .registry
                    .get_chain(&stored.tenant_id, stored.chain_uuid)
                    .await?;
                if let Some(precompile) = chain.privacy_precompile {
                    transaction.to = Some(precompile);
                }
            }
            JobType::TesseraMarkingTransaction => {
                transaction.private_for = stored.transaction.private_for.clone();
                transaction.privacy_flag = stored.transaction.privacy_flag;
            }
            other => {
                warn!(job_uuid = %next.uuid, job_type = %other, "Unexpected successor of a stored job");
            }
        }

        self.store
            .update_job(
                next.uuid,
                &next.tenant_id,
                &JobUpdate {
                    transaction: Some(transaction),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            schedule_uuid = %schedule.uuid,
            job_uuid = %next.uuid,
            "Starting marking job with enclave key"
        );
        match self.starter.execute(next.uuid, &next.tenant_id).await {
            Ok(_) => Ok(()),
            // Raced with another worker handling a redelivery of the same message
            Err(DispatchError::InvalidState(msg)) => {
                debug!(job_uuid = %next.uuid, "Next job not startable: {}", msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
