//! Message dispatch and retry orchestration
//!
//! Each "start job" message is processed by a retry loop that ends in one of:
//! - the job sent (or stored) and its status recorded
//! - the job marked FAILED with the cause in its status log
//! - cancellation, leaving the message unacknowledged for redelivery
//! - a store outage outlasting the retry budget, also left for redelivery
//!
//! Messages for different jobs run concurrently up to `max_concurrent_jobs`;
//! messages for the same job are processed one at a time.

use super::retry::{classify, RetryDecision, RetryPolicy};
use super::transport::{Delivery, DeliveryReceiver, JobEnvelope};
use crate::error::{DispatchError, DispatchResult};
use crate::job::{Job, JobStatus};
use crate::metrics;
use crate::schedule::StatusSink;
use crate::state::{JobStore, JobUpdate};
use crate::tx::SenderSet;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How processing of one message ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Job sent, stored, or resend confirmed by the node
    Done,
    /// Duplicate delivery of an already handled job
    Skipped,
    /// Job marked FAILED with this message
    Failed(String),
    /// The job could not even be marked failed
    Fatal(DispatchError),
    /// Processing stopped by shutdown; the message stays unacknowledged
    Cancelled,
    /// Payload could not be decoded
    Dropped,
}

impl MessageOutcome {
    /// Whether the message must stay unacknowledged for redelivery
    pub fn keeps_message(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Fatal(err) => err.is_connection(),
            _ => false,
        }
    }
}

/// Worker consuming "start job" messages
pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    senders: Arc<SenderSet>,
    sink: Arc<dyn StatusSink>,
    policy: RetryPolicy,
    max_concurrent_jobs: usize,
    job_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl JobDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        senders: Arc<SenderSet>,
        sink: Arc<dyn StatusSink>,
        policy: RetryPolicy,
        max_concurrent_jobs: usize,
    ) -> Self {
        Self {
            store,
            senders,
            sink,
            policy,
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            job_locks: DashMap::new(),
        }
    }

    /// Consume deliveries until the channel closes or `shutdown` fires,
    /// then wait for in-flight messages to wind down
    pub async fn run(
        self: Arc<Self>,
        mut deliveries: DeliveryReceiver,
        shutdown: CancellationToken,
    ) -> DispatchResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));
        let tracker = TaskTracker::new();

        info!(max_concurrent_jobs = self.max_concurrent_jobs, "Job dispatcher started");

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = deliveries.recv() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|_| DispatchError::Internal("dispatcher semaphore closed".into()))?,
            };

            let this = self.clone();
            let token = shutdown.child_token();
            tracker.spawn(async move {
                let _permit = permit;
                this.handle_delivery(delivery, &token).await;
            });
        }

        tracker.close();
        tracker.wait().await;
        info!("Job dispatcher stopped");
        Ok(())
    }

    /// Process one delivery and acknowledge it unless the outcome keeps it
    pub async fn handle_delivery(
        &self,
        delivery: Delivery,
        token: &CancellationToken,
    ) -> MessageOutcome {
        let envelope = match delivery.decode() {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(offset = delivery.offset(), "Dropping undecodable message: {}", e);
                delivery.ack();
                return MessageOutcome::Dropped;
            }
        };

        let outcome = self.process(envelope, token).await;
        if outcome.keeps_message() {
            warn!(offset = delivery.offset(), "Message left unacknowledged for redelivery");
        } else {
            delivery.ack();
        }
        outcome
    }

    /// Run the retry loop for one message
    pub async fn process(&self, envelope: JobEnvelope, token: &CancellationToken) -> MessageOutcome {
        let job_uuid = envelope.job.uuid;
        let lock = self
            .job_locks
            .entry(job_uuid)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let outcome = {
            let _serialized = tokio::select! {
                biased;
                _ = token.cancelled() => return MessageOutcome::Cancelled,
                guard = lock.lock() => guard,
            };
            self.process_locked(envelope, token).await
        };

        drop(lock);
        self.job_locks
            .remove_if(&job_uuid, |_, lock| Arc::strong_count(lock) == 1);
        outcome
    }

    async fn process_locked(&self, envelope: JobEnvelope, token: &CancellationToken) -> MessageOutcome {
        let mut job = match self.prepare(&envelope, token).await {
            Ok(job) => job,
            Err(outcome) => return outcome,
        };

        if let Some(reason) = duplicate_reason(&job) {
            debug!(job_uuid = %job.uuid, status = %job.status(), "Skipping message: {}", reason);
            return MessageOutcome::Skipped;
        }

        let mut budget = self.policy.budget();
        let mut pending_update = None;
        loop {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return self.cancelled(job.uuid),
                result = self.attempt(&mut job, &mut pending_update) => result,
            };

            let err = match result {
                Ok(()) => return MessageOutcome::Done,
                Err(DispatchError::Cancelled) => return self.cancelled(job.uuid),
                Err(e) => e,
            };

            match classify(err.clone(), job.is_self_resend()) {
                RetryDecision::Done => {
                    info!(job_uuid = %job.uuid, "Resent transaction already known by the node");
                    return MessageOutcome::Done;
                }
                RetryDecision::Fatal(err) => {
                    return self.fail(&mut job, err.to_string(), token).await;
                }
                RetryDecision::RetrySameAttempt => {
                    metrics::record_retry(err.kind());
                    if let DispatchError::InvalidNonceWarning(msg) = &err {
                        let update = JobUpdate::status(JobStatus::Recovering)
                            .with_message(msg.clone())
                            .with_recovery_count(job.internal.recovery_count);
                        if let Err(e) = self.sink.update_job(&mut job, update).await {
                            warn!(job_uuid = %job.uuid, "Failed to record nonce recovery: {}", e);
                        }
                    }

                    let Some(delay) = budget.next_delay() else {
                        let message = format!(
                            "giving up after {} attempts: {}",
                            budget.attempts(),
                            err
                        );
                        return self.fail(&mut job, message, token).await;
                    };
                    warn!(
                        job_uuid = %job.uuid,
                        attempt = budget.attempts(),
                        ?delay,
                        "Retrying job: {}",
                        err
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return self.cancelled(job.uuid),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Load the stored job, retrying connection errors under the budget.
    /// Without the stored status a duplicate delivery cannot be told apart.
    async fn prepare(
        &self,
        envelope: &JobEnvelope,
        token: &CancellationToken,
    ) -> Result<Job, MessageOutcome> {
        let job_uuid = envelope.job.uuid;
        let mut budget = self.policy.budget();
        loop {
            let err = match self.load_job(envelope).await {
                Ok(job) => return Ok(job),
                Err(e) => e,
            };
            if !err.is_connection() {
                error!(job_uuid = %job_uuid, "Cannot load job: {}", err);
                return Err(MessageOutcome::Fatal(err));
            }

            let Some(delay) = budget.next_delay() else {
                error!(job_uuid = %job_uuid, "Store unavailable, leaving message for redelivery: {}", err);
                return Err(MessageOutcome::Fatal(err));
            };
            warn!(job_uuid = %job_uuid, ?delay, "Retrying job load: {}", err);
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.cancelled(job_uuid)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Stored status wins over the message payload; the resend marker only
    /// lives on the message. A CREATED job whose starter has not recorded
    /// STARTED yet is promoted here.
    async fn load_job(&self, envelope: &JobEnvelope) -> DispatchResult<Job> {
        let (uuid, tenant_id) = (envelope.job.uuid, envelope.tenant_id.as_str());
        let mut job = self.store.get_job(uuid, tenant_id).await?;
        if job.status() == JobStatus::Created {
            let update = JobUpdate::status(JobStatus::Started);
            match self.sink.update_job(&mut job, update).await {
                Ok(()) => {}
                Err(DispatchError::InvalidState(_)) => {
                    job = self.store.get_job(uuid, tenant_id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        job.internal.parent_job_uuid = envelope.job.internal.parent_job_uuid;
        Ok(job)
    }

    async fn attempt(&self, job: &mut Job, pending: &mut Option<JobUpdate>) -> DispatchResult<()> {
        if job.status() == JobStatus::Stored {
            return self.sink.start_next(job).await;
        }

        // A broadcast whose status update failed is not broadcast again
        let update = match pending.take() {
            Some(update) => update,
            None => self.senders.sender_for(job.job_type).execute(job).await?,
        };
        if let Err(e) = self.sink.update_job(job, update.clone()).await {
            *pending = Some(update);
            return Err(e);
        }
        Ok(())
    }

    /// Mark the job FAILED. Connection errors on the update are retried under
    /// a fresh budget; anything else ends the message.
    async fn fail(&self, job: &mut Job, message: String, token: &CancellationToken) -> MessageOutcome {
        let mut budget = self.policy.budget();

        loop {
            let update = JobUpdate::status(JobStatus::Failed).with_message(message.clone());
            match self.sink.update_job(job, update).await {
                Ok(()) => {
                    error!(job_uuid = %job.uuid, job_type = %job.job_type, "Job failed: {}", message);
                    return MessageOutcome::Failed(message);
                }
                Err(e) if e.is_connection() => {
                    let Some(delay) = budget.next_delay() else {
                        error!(job_uuid = %job.uuid, "Cannot mark job failed: {}", e);
                        return MessageOutcome::Fatal(e);
                    };
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return self.cancelled(job.uuid),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(job_uuid = %job.uuid, "Cannot mark job failed: {}", e);
                    return MessageOutcome::Fatal(e);
                }
            }
        }
    }

    fn cancelled(&self, job_uuid: Uuid) -> MessageOutcome {
        info!(job_uuid = %job_uuid, "Job processing cancelled");
        MessageOutcome::Cancelled
    }
}

/// Why a message for `job` is a duplicate delivery, if it is one
fn duplicate_reason(job: &Job) -> Option<&'static str> {
    match job.status() {
        JobStatus::Mined | JobStatus::Failed => Some("job is final"),
        JobStatus::Pending | JobStatus::Resending | JobStatus::Warning if !job.is_self_resend() => {
            Some("job was already sent")
        }
        _ => None,
    }
}
