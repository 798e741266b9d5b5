//! Process-wide service container
//!
//! Every component is built once here from its collaborators and handed to
//! workers by reference; nothing is registered in global state.

use crate::chain::{ChainNodeClient, ChainRegistry};
use crate::config::{DispatcherConfig, GasConfig};
use crate::dispatch::{ChannelTransport, JobDispatcher, JobPublisher, RetryPolicy};
use crate::error::{DispatchError, DispatchResult};
use crate::schedule::{
    CreateJobUseCase, JobStatusUpdater, ResendJobUseCase, SendTxUseCase, StartJobUseCase,
    StatusSink,
};
use crate::state::JobStore;
use crate::tx::nonce::{NonceCache, NonceErrorClassifier};
use crate::tx::{
    GasEstimator, KeyManager, NonceSequencer, SenderContext, SenderSet,
    SubstringClassifier, TransactionCrafter, TransactionSigner,
};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// External collaborators the container is built from
pub struct Collaborators {
    pub registry: Arc<dyn ChainRegistry>,
    pub store: Arc<dyn JobStore>,
    pub node: Arc<dyn ChainNodeClient>,
    pub key_manager: Arc<dyn KeyManager>,
    /// Shared with every other instance dispatching for the same accounts
    pub nonce_cache: Arc<dyn NonceCache>,
}

pub struct Services {
    pub registry: Arc<dyn ChainRegistry>,
    pub store: Arc<dyn JobStore>,
    pub transport: Arc<ChannelTransport>,
    pub send_tx: SendTxUseCase,
    pub start_job: Arc<StartJobUseCase>,
    pub resend_job: ResendJobUseCase,
    pub create_job: CreateJobUseCase,
    pub status_updater: Arc<JobStatusUpdater>,
    pub dispatcher: Arc<JobDispatcher>,
}

impl Services {
    pub fn new(config: &DispatcherConfig, gas: &GasConfig, deps: Collaborators) -> Self {
        let Collaborators {
            registry,
            store,
            node,
            key_manager,
            nonce_cache,
        } = deps;

        let classifier: Arc<dyn NonceErrorClassifier> = match &config.nonce_error_patterns {
            Some(patterns) => Arc::new(SubstringClassifier::new(patterns.clone())),
            None => Arc::new(SubstringClassifier::default()),
        };
        let sequencer = Arc::new(NonceSequencer::new(
            nonce_cache,
            node.clone(),
            classifier,
            config.max_recovery,
        ));

        let crafter = Arc::new(TransactionCrafter::new(
            Arc::new(GasEstimator::new(node.clone(), gas)),
            sequencer.clone(),
            gas.private_gas_limit,
        ));
        let signer = Arc::new(TransactionSigner::new(key_manager));
        let senders = Arc::new(SenderSet::new(Arc::new(SenderContext::new(
            registry.clone(),
            node,
            crafter,
            signer,
            sequencer,
        ))));

        let transport = Arc::new(ChannelTransport::new(config.transport_capacity));
        let publisher: Arc<dyn JobPublisher> = transport.clone();

        let start_job = Arc::new(StartJobUseCase::new(store.clone(), publisher.clone()));
        let status_updater = Arc::new(JobStatusUpdater::new(
            store.clone(),
            registry.clone(),
            start_job.clone(),
        ));
        let sink: Arc<dyn StatusSink> = status_updater.clone();

        let dispatcher = Arc::new(JobDispatcher::new(
            store.clone(),
            senders,
            sink,
            RetryPolicy::new(config.backoff.clone()),
            config.max_concurrent_jobs,
        ));

        Self {
            send_tx: SendTxUseCase::new(registry.clone(), store.clone(), start_job.clone()),
            resend_job: ResendJobUseCase::new(store.clone(), publisher),
            create_job: CreateJobUseCase::new(store.clone(), registry.clone()),
            registry,
            store,
            transport,
            start_job,
            status_updater,
            dispatcher,
        }
    }

    /// Run the dispatcher on the transport until `shutdown` fires
    pub async fn run_dispatcher(&self, shutdown: CancellationToken) -> DispatchResult<()> {
        let deliveries = self.transport.take_receiver().ok_or_else(|| {
            DispatchError::InvalidState("the dispatcher is already consuming the transport".into())
        })?;
        info!("Dispatcher consuming start job messages");
        self.dispatcher.clone().run(deliveries, shutdown).await
    }
}
