//! Start and resend jobs by publishing them to the transport

use crate::dispatch::transport::{JobEnvelope, JobPublisher};
use crate::error::{DispatchError, DispatchResult};
use crate::job::status::check_startable;
use crate::job::{Job, JobStatus};
use crate::metrics;
use crate::state::{JobStore, JobUpdate};

use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Hands a CREATED job to the dispatcher and records it STARTED
pub struct StartJobUseCase {
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn JobPublisher>,
}

impl StartJobUseCase {
    pub fn new(store: Arc<dyn JobStore>, publisher: Arc<dyn JobPublisher>) -> Self {
        Self { store, publisher }
    }

    #[instrument(skip(self), fields(job_uuid = %job_uuid))]
    pub async fn execute(&self, job_uuid: Uuid, tenant_id: &str) -> DispatchResult<Job> {
        let job = self
            .store
            .get_job(job_uuid, tenant_id)
            .await
            .map_err(|e| e.in_component("start-job"))?;
        check_startable(job.status())?;

        // Publish before recording STARTED: a failed publish leaves the job
        // CREATED so replaying the request starts it again
        self.publisher
            .publish(&JobEnvelope::new(job))
            .await
            .map_err(|e| e.in_component("start-job"))?;

        let job = match self
            .store
            .update_job(job_uuid, tenant_id, &JobUpdate::status(JobStatus::Started))
            .await
        {
            Ok(job) => job,
            // The dispatcher promoted the job first
            Err(DispatchError::InvalidState(_)) => self
                .store
                .get_job(job_uuid, tenant_id)
                .await
                .map_err(|e| e.in_component("start-job"))?,
            Err(e) => return Err(e.in_component("start-job")),
        };

        metrics::record_job_started(job.job_type.as_str());
        info!(schedule_uuid = %job.schedule_uuid, job_type = %job.job_type, "Job started");
        Ok(job)
    }
}

/// Re-broadcasts a pending job with the same nonce and signature
pub struct ResendJobUseCase {
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn JobPublisher>,
}

impl ResendJobUseCase {
    pub fn new(store: Arc<dyn JobStore>, publisher: Arc<dyn JobPublisher>) -> Self {
        Self { store, publisher }
    }

    #[instrument(skip(self), fields(job_uuid = %job_uuid))]
    pub async fn execute(&self, job_uuid: Uuid, tenant_id: &str) -> DispatchResult<()> {
        let mut job = self
            .store
            .get_job(job_uuid, tenant_id)
            .await
            .map_err(|e| e.in_component("resend-job"))?;

        let status = job.status();
        if status != JobStatus::Pending {
            return Err(DispatchError::InvalidState(format!(
                "only pending jobs can be resent, job {job_uuid} is {status}"
            )));
        }

        job.internal.parent_job_uuid = Some(job.uuid);
        self.publisher
            .publish(&JobEnvelope::new(job))
            .await
            .map_err(|e| e.in_component("resend-job"))?;

        info!("Job resend requested");
        Ok(())
    }
}
