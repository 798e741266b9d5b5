//! Dispatching started jobs: nonce sequencing, recovery, retries and cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tx_dispatcher::config::DispatcherConfig;
use tx_dispatcher::dispatch::{Delivery, DeliveryReceiver, JobEnvelope, MessageOutcome};
use tx_dispatcher::job::{InternalData, Job, JobStatus, JobType, PrivateProtocol};
use tx_dispatcher::schedule::NewJob;
use tx_dispatcher::state::{JobStore, JobUpdate, MemoryStore};
use tx_dispatcher::test_utils::{
    harness, private_request, test_account, test_config, transfer_request, FlakyStore,
    HarnessBuilder, TestHarness, PRIVATE_FOR, TEST_TENANT,
};
use tx_dispatcher::DispatchError;

async fn next_delivery(receiver: &mut DeliveryReceiver) -> Delivery {
    tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("no message published")
        .expect("transport closed")
}

async fn wait_for_status(store: &Arc<dyn JobStore>, uuid: Uuid, status: JobStatus) -> Job {
    for _ in 0..300 {
        let job = store.get_job(uuid, TEST_TENANT).await.unwrap();
        if job.status() == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let job = store.get_job(uuid, TEST_TENANT).await.unwrap();
    panic!("job {uuid} stuck in {} waiting for {status}", job.status());
}

/// Submit a transfer and run its start message through the dispatcher
async fn send_one(h: &TestHarness, receiver: &mut DeliveryReceiver) -> (Uuid, MessageOutcome) {
    let outcome = h
        .services
        .send_tx
        .execute(transfer_request(None), TEST_TENANT)
        .await
        .unwrap();
    let delivery = next_delivery(receiver).await;
    let result = h
        .services
        .dispatcher
        .handle_delivery(delivery, &CancellationToken::new())
        .await;
    (outcome.schedule.jobs[0].uuid, result)
}

#[tokio::test]
async fn transfer_becomes_pending_with_first_nonce() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();

    let (uuid, outcome) = send_one(&h, &mut receiver).await;
    assert_eq!(outcome, MessageOutcome::Done);

    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert_eq!(job.transaction.nonce, Some(0));
    assert_eq!(h.node.sent()[0].hash, job.transaction.hash.unwrap());
    assert_eq!(h.services.transport.unacked_count(), 0);
}

#[tokio::test]
async fn concurrent_jobs_get_gapless_increasing_nonces() {
    let h = harness();
    let shutdown = CancellationToken::new();
    let services = Arc::new(h.services);
    let worker = tokio::spawn({
        let services = services.clone();
        let shutdown = shutdown.clone();
        async move { services.run_dispatcher(shutdown).await }
    });

    let submissions = (0..10).map(|_| {
        services
            .send_tx
            .execute(transfer_request(None), TEST_TENANT)
    });
    let outcomes = join_all(submissions).await;

    let mut nonces = Vec::new();
    for outcome in outcomes {
        let uuid = outcome.unwrap().schedule.jobs[0].uuid;
        let job = wait_for_status(&h.store, uuid, JobStatus::Pending).await;
        assert!(
            job.logs.iter().all(|log| log.status != JobStatus::Recovering),
            "job {uuid} needed a nonce recovery"
        );
        nonces.push(job.transaction.nonce.unwrap());
    }
    nonces.sort_unstable();
    assert_eq!(nonces, (0..10).collect::<Vec<u64>>());

    // The node accepted them strictly in order
    assert_eq!(h.node.sent_nonces(test_account()), (0..10).collect::<Vec<u64>>());

    shutdown.cancel();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn stale_cached_nonce_is_recovered_from_chain() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();

    // Nonces 0..=5 sent through the dispatcher, so the cache holds 5
    for _ in 0..6 {
        let (_, outcome) = send_one(&h, &mut receiver).await;
        assert_eq!(outcome, MessageOutcome::Done);
    }

    // Someone else used nonce 6
    h.node.set_pending_nonce(test_account(), 7);

    let (uuid, outcome) = send_one(&h, &mut receiver).await;
    assert_eq!(outcome, MessageOutcome::Done);

    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert_eq!(job.transaction.nonce, Some(7));
    assert_eq!(job.internal.recovery_count, 0);
    let statuses: Vec<JobStatus> = job.logs.iter().map(|log| log.status).collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Created,
            JobStatus::Started,
            JobStatus::Recovering,
            JobStatus::Pending
        ]
    );

    // Nonce 7 was committed: the next job follows it
    let (uuid, _) = send_one(&h, &mut receiver).await;
    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.transaction.nonce, Some(8));
}

#[tokio::test]
async fn nonce_recovery_is_bounded() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();

    for _ in 0..4 {
        h.node
            .fail_next_broadcast(DispatchError::NodeRejected("nonce too low".into()));
    }

    let (uuid, outcome) = send_one(&h, &mut receiver).await;
    let MessageOutcome::Failed(message) = outcome else {
        panic!("expected a failed job, got {outcome:?}");
    };
    assert!(message.contains("exceeded 3 nonce recoveries"), "{message}");

    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert_eq!(job.last_message(), Some(message.as_str()));
    let recoveries = job
        .logs
        .iter()
        .filter(|log| log.status == JobStatus::Recovering)
        .count();
    assert_eq!(recoveries, 3);
    assert_eq!(job.internal.recovery_count, 3);
    assert!(h.node.sent().is_empty());
}

#[tokio::test]
async fn persisted_recovery_count_bounds_a_redelivered_job() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    let outcome = h
        .services
        .send_tx
        .execute(transfer_request(None), TEST_TENANT)
        .await
        .unwrap();
    let uuid = outcome.schedule.jobs[0].uuid;
    let delivery = next_delivery(&mut receiver).await;

    // Recoveries spent by a worker that crashed before finishing the job
    h.store
        .update_job(uuid, TEST_TENANT, &JobUpdate::default().with_recovery_count(3))
        .await
        .unwrap();
    h.node
        .fail_next_broadcast(DispatchError::NodeRejected("nonce too low".into()));

    let result = h
        .services
        .dispatcher
        .handle_delivery(delivery, &CancellationToken::new())
        .await;
    let MessageOutcome::Failed(message) = result else {
        panic!("expected a failed job, got {result:?}");
    };
    assert!(message.contains("exceeded 3 nonce recoveries"), "{message}");
    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert!(job.logs.iter().all(|log| log.status != JobStatus::Recovering));
}

#[tokio::test]
async fn non_nonce_rejection_fails_the_job() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    h.node
        .fail_next_broadcast(DispatchError::NodeRejected("insufficient funds".into()));

    let (uuid, outcome) = send_one(&h, &mut receiver).await;
    assert!(matches!(outcome, MessageOutcome::Failed(_)));
    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job.last_message().unwrap().contains("insufficient funds"));
}

#[tokio::test]
async fn connection_errors_are_retried() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    h.node
        .fail_next_broadcast(DispatchError::Connection("connection reset".into()));
    h.node
        .fail_next_broadcast(DispatchError::Connection("connection reset".into()));

    let (uuid, outcome) = send_one(&h, &mut receiver).await;
    assert_eq!(outcome, MessageOutcome::Done);
    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert_eq!(job.transaction.nonce, Some(0));
}

#[tokio::test]
async fn one_time_key_retry_rebroadcasts_the_same_signature() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    let mut request = transfer_request(None);
    request.params.from = None;
    request.params.one_time_key = true;
    h.node
        .fail_next_broadcast(DispatchError::Connection("timeout after delivery".into()));

    let outcome = h
        .services
        .send_tx
        .execute(request, TEST_TENANT)
        .await
        .unwrap();
    let uuid = outcome.schedule.jobs[0].uuid;
    let delivery = next_delivery(&mut receiver).await;
    assert_eq!(
        h.services
            .dispatcher
            .handle_delivery(delivery, &CancellationToken::new())
            .await,
        MessageOutcome::Done
    );

    let attempts = h.node.broadcast_attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0], attempts[1]);
    let sent = h.node.sent();
    assert_eq!(sent.len(), 1);
    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.transaction.from, Some(sent[0].from));
    assert_eq!(job.transaction.raw.as_ref(), Some(&attempts[0]));
}

#[tokio::test]
async fn exhausted_retry_budget_fails_the_job() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    h.node.set_reachable(false);

    let (uuid, outcome) = send_one(&h, &mut receiver).await;
    let MessageOutcome::Failed(message) = outcome else {
        panic!("expected a failed job, got {outcome:?}");
    };
    assert!(message.starts_with("giving up after 6 attempts"), "{message}");
    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
}

#[tokio::test]
async fn resend_tolerates_known_transaction() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    let (uuid, _) = send_one(&h, &mut receiver).await;
    let sent = h.store.get_job(uuid, TEST_TENANT).await.unwrap();

    h.services
        .resend_job
        .execute(uuid, TEST_TENANT)
        .await
        .unwrap();
    let delivery = next_delivery(&mut receiver).await;
    let outcome = h
        .services
        .dispatcher
        .handle_delivery(delivery, &CancellationToken::new())
        .await;
    assert_eq!(outcome, MessageOutcome::Done);

    // Same bytes were pushed again and the node already knew them
    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert_eq!(job.transaction.hash, sent.transaction.hash);
    assert_eq!(h.node.sent().len(), 1);
}

#[tokio::test]
async fn duplicate_start_message_is_skipped() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    let outcome = h
        .services
        .send_tx
        .execute(transfer_request(None), TEST_TENANT)
        .await
        .unwrap();
    let job = outcome.schedule.jobs[0].clone();
    let first = next_delivery(&mut receiver).await;
    let envelope = first.decode().unwrap();

    let token = CancellationToken::new();
    assert_eq!(
        h.services.dispatcher.handle_delivery(first, &token).await,
        MessageOutcome::Done
    );
    assert_eq!(
        h.services.dispatcher.process(envelope, &token).await,
        MessageOutcome::Skipped
    );
    assert_eq!(h.node.sent().len(), 1);
    assert_eq!(
        h.store.get_job(job.uuid, TEST_TENANT).await.unwrap().status(),
        JobStatus::Pending
    );
}

#[tokio::test]
async fn eea_stored_payload_starts_marking_job() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    let outcome = h
        .services
        .send_tx
        .execute(private_request(PrivateProtocol::Eea), TEST_TENANT)
        .await
        .unwrap();
    let private = outcome.schedule.jobs[0].uuid;
    let marking = outcome.schedule.jobs[1].uuid;
    let token = CancellationToken::new();

    let delivery = next_delivery(&mut receiver).await;
    assert_eq!(
        h.services.dispatcher.handle_delivery(delivery, &token).await,
        MessageOutcome::Done
    );
    let stored = h.store.get_job(private, TEST_TENANT).await.unwrap();
    assert_eq!(stored.status(), JobStatus::Stored);
    assert!(stored.transaction.enclave_key.is_some());
    assert_eq!(h.node.distributed().len(), 1);

    // The marking job was started with the enclave key as payload
    let delivery = next_delivery(&mut receiver).await;
    assert_eq!(delivery.decode().unwrap().job.uuid, marking);
    assert_eq!(
        h.services.dispatcher.handle_delivery(delivery, &token).await,
        MessageOutcome::Done
    );

    let marked = h.store.get_job(marking, TEST_TENANT).await.unwrap();
    assert_eq!(marked.status(), JobStatus::Pending);
    assert_eq!(marked.transaction.to, h.chain.privacy_precompile);
    assert_eq!(marked.transaction.data.unwrap().len(), 32);
    assert_eq!(h.node.sent_nonces(test_account()), vec![0]);
}

#[tokio::test]
async fn tessera_payload_is_stored_then_marked_privately() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    let outcome = h
        .services
        .send_tx
        .execute(private_request(PrivateProtocol::Tessera), TEST_TENANT)
        .await
        .unwrap();
    let marking = outcome.schedule.jobs[1].uuid;
    let token = CancellationToken::new();

    let delivery = next_delivery(&mut receiver).await;
    h.services.dispatcher.handle_delivery(delivery, &token).await;
    let stored = h.node.stored_payloads();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].0.to_vec(), vec![0xca, 0xfe]);

    let delivery = next_delivery(&mut receiver).await;
    assert_eq!(
        h.services.dispatcher.handle_delivery(delivery, &token).await,
        MessageOutcome::Done
    );
    let marked = h.store.get_job(marking, TEST_TENANT).await.unwrap();
    assert_eq!(marked.status(), JobStatus::Pending);
    assert_eq!(marked.transaction.private_for, vec![PRIVATE_FOR.to_string()]);

    let private = h.node.quorum_private();
    assert_eq!(private.len(), 1);
    assert_eq!(private[0].1, vec![PRIVATE_FOR.to_string()]);
}

#[tokio::test]
async fn cancelled_message_stays_unacknowledged() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    h.node.set_broadcast_delay(Duration::from_millis(500));

    let outcome = h
        .services
        .send_tx
        .execute(transfer_request(None), TEST_TENANT)
        .await
        .unwrap();
    let uuid = outcome.schedule.jobs[0].uuid;
    let delivery = next_delivery(&mut receiver).await;

    let token = CancellationToken::new();
    let task = tokio::spawn({
        let dispatcher = h.services.dispatcher.clone();
        let token = token.clone();
        async move { dispatcher.handle_delivery(delivery, &token).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    assert_eq!(task.await.unwrap(), MessageOutcome::Cancelled);
    assert_eq!(h.services.transport.unacked_count(), 1);
    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.status(), JobStatus::Started);
    assert!(h.node.sent().is_empty());

    // Redelivery picks the job up again
    h.node.set_broadcast_delay(Duration::ZERO);
    assert_eq!(h.services.transport.redeliver_unacked().unwrap(), 1);
    let delivery = next_delivery(&mut receiver).await;
    assert_eq!(
        h.services
            .dispatcher
            .handle_delivery(delivery, &CancellationToken::new())
            .await,
        MessageOutcome::Done
    );
    assert_eq!(h.services.transport.unacked_count(), 0);
    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert_eq!(job.transaction.nonce, Some(0));
}

#[tokio::test]
async fn failed_status_update_is_retried_without_rebroadcast() {
    let flaky = Arc::new(FlakyStore::new(Arc::new(MemoryStore::new())));
    let h = HarnessBuilder::new().store(flaky.clone()).build();
    let mut receiver = h.services.transport.take_receiver().unwrap();

    let outcome = h
        .services
        .send_tx
        .execute(transfer_request(None), TEST_TENANT)
        .await
        .unwrap();
    let uuid = outcome.schedule.jobs[0].uuid;
    let delivery = next_delivery(&mut receiver).await;

    flaky.fail_updates(2, DispatchError::Connection("store connection lost".into()));
    let result = h
        .services
        .dispatcher
        .handle_delivery(delivery, &CancellationToken::new())
        .await;
    assert_eq!(result, MessageOutcome::Done);

    assert_eq!(h.node.sent().len(), 1);
    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert_eq!(job.transaction.nonce, Some(0));

    let applied: Vec<_> = flaky
        .applied_updates()
        .into_iter()
        .filter(|(job_uuid, _)| *job_uuid == uuid)
        .map(|(_, update)| update.status)
        .collect();
    assert_eq!(
        applied,
        vec![Some(JobStatus::Started), Some(JobStatus::Pending)]
    );
}

#[tokio::test]
async fn unknown_job_message_is_fatal() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    let outcome = h
        .services
        .send_tx
        .execute(transfer_request(None), TEST_TENANT)
        .await
        .unwrap();
    let mut envelope = next_delivery(&mut receiver).await.decode().unwrap();
    envelope.job.uuid = Uuid::new_v4();
    assert_ne!(envelope.job.uuid, outcome.schedule.jobs[0].uuid);

    let result = h
        .services
        .dispatcher
        .process(envelope, &CancellationToken::new())
        .await;
    assert!(matches!(
        result,
        MessageOutcome::Fatal(DispatchError::NotFound(_))
    ));
}

#[tokio::test]
async fn redelivery_during_store_outage_is_not_rebroadcast() {
    let flaky = Arc::new(FlakyStore::new(Arc::new(MemoryStore::new())));
    let h = HarnessBuilder::new().store(flaky.clone()).build();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    h.services
        .send_tx
        .execute(transfer_request(None), TEST_TENANT)
        .await
        .unwrap();
    let first = next_delivery(&mut receiver).await;
    let envelope = first.decode().unwrap();

    let token = CancellationToken::new();
    assert_eq!(
        h.services.dispatcher.handle_delivery(first, &token).await,
        MessageOutcome::Done
    );

    // The redelivered payload still says STARTED without a nonce
    flaky.fail_reads(1, DispatchError::Connection("store connection lost".into()));
    assert_eq!(
        h.services.dispatcher.process(envelope, &token).await,
        MessageOutcome::Skipped
    );
    assert_eq!(h.node.sent().len(), 1);
}

#[tokio::test]
async fn store_outage_leaves_message_for_redelivery() {
    let flaky = Arc::new(FlakyStore::new(Arc::new(MemoryStore::new())));
    let h = HarnessBuilder::new().store(flaky.clone()).build();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    let outcome = h
        .services
        .send_tx
        .execute(transfer_request(None), TEST_TENANT)
        .await
        .unwrap();
    let uuid = outcome.schedule.jobs[0].uuid;
    let delivery = next_delivery(&mut receiver).await;

    // One failure per attempt of the retry budget
    flaky.fail_reads(6, DispatchError::Connection("store connection lost".into()));
    let token = CancellationToken::new();
    let result = h.services.dispatcher.handle_delivery(delivery, &token).await;
    assert!(
        matches!(result, MessageOutcome::Fatal(DispatchError::Connection(_))),
        "got {result:?}"
    );
    assert_eq!(h.services.transport.unacked_count(), 1);
    assert!(h.node.sent().is_empty());

    assert_eq!(h.services.transport.redeliver_unacked().unwrap(), 1);
    let delivery = next_delivery(&mut receiver).await;
    assert_eq!(
        h.services.dispatcher.handle_delivery(delivery, &token).await,
        MessageOutcome::Done
    );
    assert_eq!(h.services.transport.unacked_count(), 0);
    let job = h.store.get_job(uuid, TEST_TENANT).await.unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
}

#[tokio::test]
async fn message_for_a_created_job_starts_it() {
    let h = harness();
    let mut receiver = h.services.transport.take_receiver().unwrap();
    let outcome = h
        .services
        .send_tx
        .execute(transfer_request(None), TEST_TENANT)
        .await
        .unwrap();
    let first = &outcome.schedule.jobs[0];
    let _ = next_delivery(&mut receiver).await;

    // Published, but its starter has not recorded STARTED yet
    let job = h
        .services
        .create_job
        .execute(
            NewJob {
                schedule_uuid: first.schedule_uuid,
                chain_uuid: first.chain_uuid,
                job_type: JobType::EthereumTransaction,
                transaction: first.transaction.clone(),
                internal: InternalData {
                    chain_id: first.internal.chain_id,
                    ..Default::default()
                },
                labels: Default::default(),
            },
            TEST_TENANT,
        )
        .await
        .unwrap();
    assert_eq!(job.status(), JobStatus::Created);

    let result = h
        .services
        .dispatcher
        .process(JobEnvelope::new(job.clone()), &CancellationToken::new())
        .await;
    assert_eq!(result, MessageOutcome::Done);

    let job = h.store.get_job(job.uuid, TEST_TENANT).await.unwrap();
    let statuses: Vec<JobStatus> = job.logs.iter().map(|log| log.status).collect();
    assert_eq!(
        statuses,
        vec![JobStatus::Created, JobStatus::Started, JobStatus::Pending]
    );
}

#[tokio::test]
async fn worker_publishes_never_stall_the_dispatch_loop() {
    let config = DispatcherConfig {
        transport_capacity: 1,
        max_concurrent_jobs: 1,
        ..test_config()
    };
    let h = HarnessBuilder::new().config(config).build();
    let shutdown = CancellationToken::new();
    let services = Arc::new(h.services);

    // Queued before the loop runs: the private job's marking successor is
    // published by the only worker while both transfers wait in the channel
    let private = services
        .send_tx
        .execute(private_request(PrivateProtocol::Eea), TEST_TENANT)
        .await
        .unwrap();
    let mut transfers = Vec::new();
    for _ in 0..2 {
        let outcome = services
            .send_tx
            .execute(transfer_request(None), TEST_TENANT)
            .await
            .unwrap();
        transfers.push(outcome.schedule.jobs[0].uuid);
    }

    let worker = tokio::spawn({
        let services = services.clone();
        let shutdown = shutdown.clone();
        async move { services.run_dispatcher(shutdown).await }
    });

    wait_for_status(&h.store, private.schedule.jobs[1].uuid, JobStatus::Pending).await;
    for uuid in transfers {
        wait_for_status(&h.store, uuid, JobStatus::Pending).await;
    }
    assert_eq!(services.transport.unacked_count(), 0);

    shutdown.cancel();
    worker.await.unwrap().unwrap();
}
