//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Schedule creation and idempotent replays
//! - Job processing by type and outcome
//! - Retries and nonce recovery
//! - Status update failures

use crate::error::{DispatchError, DispatchResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

lazy_static! {
    // Request metrics
    pub static ref SCHEDULES_CREATED: IntCounter = register_int_counter!(
        "dispatcher_schedules_created_total",
        "Total schedules materialized from new requests"
    ).unwrap();

    pub static ref IDEMPOTENT_REPLAYS: IntCounter = register_int_counter!(
        "dispatcher_idempotent_replays_total",
        "Total requests answered from an existing schedule"
    ).unwrap();

    // Job metrics
    pub static ref JOBS_STARTED: IntCounterVec = register_int_counter_vec!(
        "dispatcher_jobs_started_total",
        "Total jobs started",
        &["job_type"]
    ).unwrap();

    pub static ref JOBS_SENT: IntCounterVec = register_int_counter_vec!(
        "dispatcher_jobs_sent_total",
        "Total jobs sent by resulting status",
        &["job_type", "status"]
    ).unwrap();

    pub static ref JOBS_FAILED: IntCounterVec = register_int_counter_vec!(
        "dispatcher_jobs_failed_total",
        "Total jobs marked failed",
        &["job_type"]
    ).unwrap();

    pub static ref RETRIES: IntCounterVec = register_int_counter_vec!(
        "dispatcher_retries_total",
        "Total retried attempts by error kind",
        &["reason"]
    ).unwrap();

    // Nonce metrics
    pub static ref NONCE_RECOVERIES: IntCounter = register_int_counter!(
        "dispatcher_nonce_recoveries_total",
        "Total nonce-class failures handed back for recovery"
    ).unwrap();

    pub static ref NONCE_CACHE: IntCounterVec = register_int_counter_vec!(
        "dispatcher_nonce_cache_lookups_total",
        "Nonce cache lookups by result",
        &["result"]
    ).unwrap();

    pub static ref STATUS_UPDATE_FAILURES: IntCounter = register_int_counter!(
        "dispatcher_status_update_failures_total",
        "Total status updates the store refused or could not take"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> DispatchResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            DispatchError::Config(format!("cannot bind metrics on {addr}: {e}"))
        })?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| DispatchError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_schedule_created() {
    SCHEDULES_CREATED.inc();
}

pub fn record_idempotent_replay() {
    IDEMPOTENT_REPLAYS.inc();
}

pub fn record_job_started(job_type: &str) {
    JOBS_STARTED.with_label_values(&[job_type]).inc();
}

pub fn record_job_sent(job_type: &str, status: &str) {
    JOBS_SENT.with_label_values(&[job_type, status]).inc();
}

pub fn record_job_failed(job_type: &str) {
    JOBS_FAILED.with_label_values(&[job_type]).inc();
}

pub fn record_retry(reason: &str) {
    RETRIES.with_label_values(&[reason]).inc();
}

pub fn record_nonce_recovery() {
    NONCE_RECOVERIES.inc();
}

pub fn record_nonce_cache(hit: bool) {
    NONCE_CACHE
        .with_label_values(&[if hit { "hit" } else { "miss" }])
        .inc();
}

pub fn record_status_update_failure() {
    STATUS_UPDATE_FAILURES.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_exported() {
        record_job_sent("ethereum_transaction", "PENDING");
        record_nonce_cache(true);

        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"dispatcher_jobs_sent_total".to_string()));
        assert!(names.contains(&"dispatcher_nonce_cache_lookups_total".to_string()));
    }
}
