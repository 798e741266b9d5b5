//! "Start job" messages and the in-process transport carrying them
//!
//! Deliveries stay registered as unacknowledged until the consumer acks them,
//! so a crashed or cancelled worker leaves them available for redelivery.
//! Publishing never waits on the consumer: dispatcher workers publish the
//! successors of the jobs they handle into the channel their own loop drains.

use crate::error::{DispatchError, DispatchResult};
use crate::job::Job;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Payload of a "start job" message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub tenant_id: String,
    pub job: Job,
}

impl JobEnvelope {
    pub fn new(job: Job) -> Self {
        Self {
            tenant_id: job.tenant_id.clone(),
            job,
        }
    }
}

/// Producer side of the message transport
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, envelope: &JobEnvelope) -> DispatchResult<()>;
}

type Unacked = Arc<DashMap<u64, Vec<u8>>>;

pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

/// One message handed to a consumer
#[derive(Debug)]
pub struct Delivery {
    offset: u64,
    payload: Vec<u8>,
    unacked: Unacked,
}

impl Delivery {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn decode(&self) -> DispatchResult<JobEnvelope> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| DispatchError::Encoding(format!("message {}: {}", self.offset, e)))
    }

    /// Commit the offset. The message is never redelivered afterwards.
    pub fn ack(self) {
        self.unacked.remove(&self.offset);
        debug!(offset = self.offset, "Acknowledged message");
    }
}

/// Channel transport with manual acknowledgement
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Mutex<Option<DeliveryReceiver>>,
    next_offset: AtomicU64,
    unacked: Unacked,
    backlog_warning: usize,
}

impl ChannelTransport {
    /// `backlog_warning` is the unacknowledged count above which publishes warn
    pub fn new(backlog_warning: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            next_offset: AtomicU64::new(0),
            unacked: Arc::new(DashMap::new()),
            backlog_warning: backlog_warning.max(1),
        }
    }

    /// Hand the consumer end to a dispatcher. Only the first caller gets it.
    pub fn take_receiver(&self) -> Option<DeliveryReceiver> {
        self.receiver.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    /// Push every unacknowledged message to the consumer again, oldest first
    pub fn redeliver_unacked(&self) -> DispatchResult<usize> {
        let mut pending: Vec<(u64, Vec<u8>)> = self
            .unacked
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        pending.sort_by_key(|(offset, _)| *offset);

        let count = pending.len();
        for (offset, payload) in pending {
            self.deliver(offset, payload)?;
        }
        if count > 0 {
            warn!(count, "Redelivered unacknowledged messages");
        }
        Ok(count)
    }

    fn deliver(&self, offset: u64, payload: Vec<u8>) -> DispatchResult<()> {
        let delivery = Delivery {
            offset,
            payload,
            unacked: self.unacked.clone(),
        };
        self.sender
            .send(delivery)
            .map_err(|_| DispatchError::Connection("job transport is closed".into()))
    }
}

#[async_trait]
impl JobPublisher for ChannelTransport {
    async fn publish(&self, envelope: &JobEnvelope) -> DispatchResult<()> {
        let payload = serde_json::to_vec(envelope)?;
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.unacked.insert(offset, payload.clone());

        if let Err(e) = self.deliver(offset, payload) {
            self.unacked.remove(&offset);
            return Err(e);
        }

        let backlog = self.unacked.len();
        if backlog > self.backlog_warning {
            warn!(backlog, "Start job messages are piling up unacknowledged");
        }
        debug!(offset, job_uuid = %envelope.job.uuid, "Published start job message");
        Ok(())
    }
}
