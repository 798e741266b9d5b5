//! In-process job store

use super::{apply_update, parent_of, JobStore, JobUpdate};
use crate::error::{DispatchError, DispatchResult};
use crate::job::status::check_child_allowed;
use crate::job::{Job, Schedule, TxRequest};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

struct ScheduleRow {
    schedule: Schedule,
    job_uuids: Vec<Uuid>,
}

#[derive(Default)]
struct Tables {
    /// (idempotency_key, tenant_id) -> request
    requests: HashMap<(String, String), TxRequest>,
    schedules: HashMap<Uuid, ScheduleRow>,
    jobs: HashMap<Uuid, Job>,
}

/// Store keeping every table behind one lock.
/// Holding the lock for a whole operation gives the same isolation as a row lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of schedules stored (for testing)
    pub async fn schedule_count(&self) -> usize {
        self.tables.lock().await.schedules.len()
    }

    /// Number of jobs stored (for testing)
    pub async fn job_count(&self) -> usize {
        self.tables.lock().await.jobs.len()
    }
}

fn job_in_tenant<'a>(tables: &'a Tables, uuid: Uuid, tenant_id: &str) -> DispatchResult<&'a Job> {
    tables
        .jobs
        .get(&uuid)
        .filter(|job| job.tenant_id == tenant_id)
        .ok_or_else(|| DispatchError::NotFound(format!("job {uuid}")))
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn health_check(&self) -> DispatchResult<()> {
        Ok(())
    }

    async fn find_tx_request(
        &self,
        idempotency_key: &str,
        tenant_id: &str,
    ) -> DispatchResult<Option<TxRequest>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .requests
            .get(&(idempotency_key.to_string(), tenant_id.to_string()))
            .cloned())
    }

    async fn insert_schedule(
        &self,
        request: &TxRequest,
        schedule: &Schedule,
    ) -> DispatchResult<()> {
        let mut tables = self.tables.lock().await;
        let key = (request.idempotency_key.clone(), request.tenant_id.clone());
        if tables.requests.contains_key(&key) {
            return Err(DispatchError::AlreadyExists(format!(
                "request with idempotency key {}",
                request.idempotency_key
            )));
        }

        tables.requests.insert(key, request.clone());
        let job_uuids = schedule.jobs.iter().map(|job| job.uuid).collect();
        for job in &schedule.jobs {
            tables.jobs.insert(job.uuid, job.clone());
        }
        tables.schedules.insert(
            schedule.uuid,
            ScheduleRow {
                schedule: Schedule {
                    jobs: Vec::new(),
                    ..schedule.clone()
                },
                job_uuids,
            },
        );

        debug!(schedule_uuid = %schedule.uuid, jobs = schedule.jobs.len(), "Stored schedule");
        Ok(())
    }

    async fn get_schedule(&self, uuid: Uuid, tenant_id: &str) -> DispatchResult<Schedule> {
        let tables = self.tables.lock().await;
        let row = tables
            .schedules
            .get(&uuid)
            .filter(|row| row.schedule.tenant_id == tenant_id)
            .ok_or_else(|| DispatchError::NotFound(format!("schedule {uuid}")))?;

        let mut schedule = row.schedule.clone();
        schedule.jobs = row
            .job_uuids
            .iter()
            .filter_map(|job_uuid| tables.jobs.get(job_uuid).cloned())
            .collect();
        Ok(schedule)
    }

    async fn get_job(&self, uuid: Uuid, tenant_id: &str) -> DispatchResult<Job> {
        let tables = self.tables.lock().await;
        job_in_tenant(&tables, uuid, tenant_id).cloned()
    }

    async fn insert_job(&self, job: &Job) -> DispatchResult<Job> {
        let mut guard = self.tables.lock().await;
        let tables = &mut *guard;

        if let Some(parent) = parent_of(job) {
            let parent = job_in_tenant(tables, parent, &job.tenant_id)?;
            check_child_allowed(parent.status())?;
        }

        let row = tables
            .schedules
            .get_mut(&job.schedule_uuid)
            .filter(|row| row.schedule.tenant_id == job.tenant_id)
            .ok_or_else(|| DispatchError::NotFound(format!("schedule {}", job.schedule_uuid)))?;

        let mut stored = job.clone();
        stored.position = row.job_uuids.len() as u32;
        row.job_uuids.push(stored.uuid);
        tables.jobs.insert(stored.uuid, stored.clone());

        Ok(stored)
    }

    async fn update_job(
        &self,
        uuid: Uuid,
        tenant_id: &str,
        update: &JobUpdate,
    ) -> DispatchResult<Job> {
        let mut tables = self.tables.lock().await;
        job_in_tenant(&tables, uuid, tenant_id)?;

        let job = tables
            .jobs
            .get_mut(&uuid)
            .ok_or_else(|| DispatchError::NotFound(format!("job {uuid}")))?;
        let mut updated = job.clone();
        apply_update(&mut updated, update)?;
        *job = updated.clone();

        Ok(updated)
    }
}
