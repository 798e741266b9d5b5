//! Nonce sequencing for reliable transaction submission
//!
//! Handles:
//! - Per-partition "last sent" nonce cache with expiry
//! - Chain fallback when the cache is empty
//! - Reconciliation after nonce-class broadcast failures
//! - Bounded recovery per job, counted in the job's internal data
//!
//! Every read-check-write on a partition happens while holding its
//! [`PartitionGuard`], so concurrent jobs on one account never interleave.
//! Across instances the cache itself makes commits and evictions atomic.

use crate::chain::{Chain, ChainNodeClient};
use crate::error::{DispatchError, DispatchResult};
use crate::job::{Job, JobType};
use crate::metrics;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Node error fragments that mean the nonce was wrong
pub const DEFAULT_NONCE_ERROR_PATTERNS: &[&str] = &[
    "nonce too low",
    "incorrect nonce",
    "replacement transaction",
];

/// Decides whether a broadcast error is nonce-class
pub trait NonceErrorClassifier: Send + Sync {
    fn is_nonce_error(&self, err: &DispatchError) -> bool;
}

/// Case-insensitive substring match on the error text.
/// Nodes do not return a typed error for nonce problems.
pub struct SubstringClassifier {
    patterns: Vec<String>,
}

impl SubstringClassifier {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }
}

impl Default for SubstringClassifier {
    fn default() -> Self {
        Self::new(
            DEFAULT_NONCE_ERROR_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        )
    }
}

impl NonceErrorClassifier for SubstringClassifier {
    fn is_nonce_error(&self, err: &DispatchError) -> bool {
        let text = err.to_string().to_lowercase();
        self.patterns.iter().any(|p| text.contains(p.as_str()))
    }
}

/// Shared store of the last nonce sent per partition key
#[async_trait]
pub trait NonceCache: Send + Sync {
    async fn get_last_sent(&self, key: &str) -> DispatchResult<Option<u64>>;

    async fn set_last_sent(&self, key: &str, nonce: u64) -> DispatchResult<()>;

    async fn delete_last_sent(&self, key: &str) -> DispatchResult<()>;

    /// Store `nonce` unless the cached value is not its predecessor.
    /// Returns whether it was stored.
    async fn commit_next(&self, key: &str, nonce: u64) -> DispatchResult<bool> {
        let commit = match self.get_last_sent(key).await? {
            None => true,
            Some(last_sent) => nonce == last_sent + 1,
        };
        if commit {
            self.set_last_sent(key, nonce).await?;
        }
        Ok(commit)
    }

    /// Drop the cached value if `nonce` was allocated from it.
    /// Returns whether it was dropped.
    async fn evict_if_next(&self, key: &str, nonce: u64) -> DispatchResult<bool> {
        match self.get_last_sent(key).await? {
            Some(last_sent) if nonce == last_sent + 1 => {
                self.delete_last_sent(key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// In-process nonce cache; entries expire after `ttl`
pub struct MemoryNonceCache {
    entries: DashMap<String, (u64, Instant)>,
    ttl: Duration,
}

impl MemoryNonceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }
}

#[async_trait]
impl NonceCache for MemoryNonceCache {
    async fn get_last_sent(&self, key: &str) -> DispatchResult<Option<u64>> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                let (nonce, stored_at) = *entry;
                if stored_at.elapsed() < self.ttl {
                    return Ok(Some(nonce));
                }
                true
            }
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set_last_sent(&self, key: &str, nonce: u64) -> DispatchResult<()> {
        self.entries.insert(key.to_string(), (nonce, Instant::now()));
        Ok(())
    }

    async fn delete_last_sent(&self, key: &str) -> DispatchResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

type PartitionLocks = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Exclusive access to one nonce partition. The partition's lock entry is
/// pruned on release when nobody else waits on it.
pub struct PartitionGuard {
    key: String,
    lock: Option<OwnedMutexGuard<()>>,
    locks: PartitionLocks,
}

impl PartitionGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for PartitionGuard {
    fn drop(&mut self) {
        drop(self.lock.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Serializes nonce allocation per partition key
pub struct NonceSequencer {
    cache: Arc<dyn NonceCache>,
    node: Arc<dyn ChainNodeClient>,
    classifier: Arc<dyn NonceErrorClassifier>,
    max_recovery: u32,
    locks: PartitionLocks,
}

impl NonceSequencer {
    pub fn new(
        cache: Arc<dyn NonceCache>,
        node: Arc<dyn ChainNodeClient>,
        classifier: Arc<dyn NonceErrorClassifier>,
        max_recovery: u32,
    ) -> Self {
        Self {
            cache,
            node,
            classifier,
            max_recovery,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Wait for exclusive access to a partition
    pub async fn acquire(&self, key: &str) -> PartitionGuard {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        PartitionGuard {
            key: key.to_string(),
            lock: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    /// Next nonce for the job: cached last-sent + 1, or the chain's pending nonce
    pub async fn get_nonce(
        &self,
        guard: &PartitionGuard,
        chain: &Chain,
        job: &Job,
    ) -> DispatchResult<u64> {
        if let Some(last_sent) = self.cache.get_last_sent(guard.key()).await? {
            metrics::record_nonce_cache(true);
            debug!(partition_key = guard.key(), last_sent, "Nonce from cache");
            return Ok(last_sent + 1);
        }

        metrics::record_nonce_cache(false);
        let nonce = self.fetch_chain_nonce(chain, job).await?;
        debug!(partition_key = guard.key(), nonce, "Nonce from chain");
        Ok(nonce)
    }

    /// Commit the job's nonce as last-sent after a successful broadcast and
    /// clear its recovery count
    pub async fn increment_nonce(&self, guard: &PartitionGuard, job: &mut Job) -> DispatchResult<()> {
        job.internal.recovery_count = 0;
        let Some(nonce) = job.transaction.nonce else {
            return Ok(());
        };

        if self.cache.commit_next(guard.key(), nonce).await? {
            debug!(partition_key = guard.key(), nonce, job_uuid = %job.uuid, "Committed nonce");
        } else {
            debug!(
                partition_key = guard.key(),
                nonce,
                job_uuid = %job.uuid,
                "Skipped stale nonce commit"
            );
        }
        Ok(())
    }

    /// Reconcile after a failed broadcast.
    ///
    /// Returns `Ok(())` when `err` is not nonce-class or the job is a self-resend.
    /// Otherwise the job is reset for recrafting and an `InvalidNonceWarning` is
    /// returned, or an `InvalidNonce` once the job ran out of recoveries.
    /// The caller persists `job.internal.recovery_count`.
    pub async fn clean_nonce(
        &self,
        guard: &PartitionGuard,
        job: &mut Job,
        err: &DispatchError,
    ) -> DispatchResult<()> {
        if !self.classifier.is_nonce_error(err) || job.is_self_resend() {
            return Ok(());
        }

        let attempts = job.internal.recovery_count;
        if attempts >= self.max_recovery {
            warn!(
                job_uuid = %job.uuid,
                partition_key = guard.key(),
                attempts,
                "Nonce recovery budget exhausted"
            );
            return Err(DispatchError::InvalidNonce(format!(
                "job {} exceeded {} nonce recoveries: {}",
                job.uuid, self.max_recovery, err
            )));
        }

        if let Some(nonce) = job.transaction.nonce {
            if self.cache.evict_if_next(guard.key(), nonce).await? {
                debug!(partition_key = guard.key(), nonce, "Evicted cached nonce");
            }
        }

        job.transaction.reset_signature();
        job.internal.recovery_count = attempts + 1;
        metrics::record_nonce_recovery();
        warn!(
            job_uuid = %job.uuid,
            partition_key = guard.key(),
            attempt = attempts + 1,
            "Nonce rejected by node, job reset: {}",
            err
        );

        Err(DispatchError::InvalidNonceWarning(err.to_string()))
    }

    async fn fetch_chain_nonce(&self, chain: &Chain, job: &Job) -> DispatchResult<u64> {
        let from = job
            .transaction
            .from
            .ok_or_else(|| DispatchError::InvalidParameter("job has no sender".into()))?;

        if job.job_type == JobType::EeaPrivateTransaction {
            if let Some(group) = &job.transaction.privacy_group_id {
                return self.node.priv_nonce(chain, from, group).await;
            }
            let private_from = job.transaction.private_from.as_deref().ok_or_else(|| {
                DispatchError::InvalidParameter("EEA job has no private_from".into())
            })?;
            return self
                .node
                .priv_eea_nonce(chain, from, private_from, &job.transaction.private_for)
                .await;
        }

        self.node.pending_nonce_at(chain, from).await
    }
}
