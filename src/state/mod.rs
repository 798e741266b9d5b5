//! Job persistence
//!
//! Handles:
//! - Transaction request lookup by idempotency key
//! - Atomic schedule + jobs insertion
//! - Status transitions under a job row lock
//! - Child job insertion guarded by the parent's status
//! - The nonce cache shared by every dispatcher instance

mod manager;
mod memory;
mod nonce_cache;

pub use manager::StateManager;
pub use memory::MemoryStore;
pub use nonce_cache::PgNonceCache;

use crate::error::DispatchResult;
use crate::job::status::{check_transition, StatusLog};
use crate::job::{EthTransaction, Job, JobStatus, Schedule, TxRequest};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

/// Changes applied to a job by [`JobStore::update_job`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub message: Option<String>,
    pub transaction: Option<EthTransaction>,
    pub recovery_count: Option<u32>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_transaction(mut self, transaction: EthTransaction) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn with_recovery_count(mut self, count: u32) -> Self {
        self.recovery_count = Some(count);
        self
    }
}

/// Job/Schedule store collaborator
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn health_check(&self) -> DispatchResult<()>;

    async fn find_tx_request(
        &self,
        idempotency_key: &str,
        tenant_id: &str,
    ) -> DispatchResult<Option<TxRequest>>;

    /// Persist a request, its schedule and every job of the schedule in one transaction.
    /// A request already stored under the same idempotency key yields `AlreadyExists`.
    async fn insert_schedule(&self, request: &TxRequest, schedule: &Schedule)
        -> DispatchResult<()>;

    async fn get_schedule(&self, uuid: Uuid, tenant_id: &str) -> DispatchResult<Schedule>;

    async fn get_job(&self, uuid: Uuid, tenant_id: &str) -> DispatchResult<Job>;

    /// Append a job to an existing schedule and return it with its position.
    /// When the job names a parent, the parent row is locked and must be `PENDING`.
    async fn insert_job(&self, job: &Job) -> DispatchResult<Job>;

    /// Apply `update` to a job under its row lock and return the updated job
    async fn update_job(
        &self,
        uuid: Uuid,
        tenant_id: &str,
        update: &JobUpdate,
    ) -> DispatchResult<Job>;
}

/// Validate and apply an update to a locked job
pub(crate) fn apply_update(job: &mut Job, update: &JobUpdate) -> DispatchResult<()> {
    if let Some(next) = update.status {
        check_transition(job.status(), next)?;
    }

    if let Some(transaction) = &update.transaction {
        job.transaction = transaction.clone();
    }
    if let Some(count) = update.recovery_count {
        job.internal.recovery_count = count;
    }
    if let Some(next) = update.status {
        job.logs.push(StatusLog::new(next, update.message.clone()));
    }
    job.updated_at = Utc::now();

    Ok(())
}

/// Parent referenced by a child job, if any
pub(crate) fn parent_of(job: &Job) -> Option<Uuid> {
    job.internal
        .parent_job_uuid
        .filter(|parent| *parent != job.uuid)
}
