//! Transaction dispatcher - schedules client transactions as jobs and sends them
//! with per-account nonce sequencing.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tx_dispatcher::api;
use tx_dispatcher::chain::{ConfigChainRegistry, EthNodeClient};
use tx_dispatcher::config::{Settings, StoreBackend};
use tx_dispatcher::metrics::MetricsServer;
use tx_dispatcher::service::{Collaborators, Services};
use tx_dispatcher::state::{JobStore, MemoryStore, StateManager};
use tx_dispatcher::tx::{LocalKeyManager, MemoryNonceCache, NonceCache};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting transaction dispatcher v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        instance_id = %settings.dispatcher.instance_id,
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Initialize job store and the nonce cache shared between instances
    let nonce_ttl = settings.dispatcher.nonce_cache_ttl();
    let (store, nonce_cache): (Arc<dyn JobStore>, Arc<dyn NonceCache>) =
        match settings.database.backend {
            StoreBackend::Postgres => {
                let manager = StateManager::new(&settings.database).await?;
                info!("Database connection established");
                manager.run_migrations().await?;
                info!("Database migrations complete");
                let cache = manager.nonce_cache(nonce_ttl);
                (Arc::new(manager), Arc::new(cache))
            }
            StoreBackend::Memory => {
                warn!("Using the in-memory job store, jobs are lost on restart");
                (
                    Arc::new(MemoryStore::new()),
                    Arc::new(MemoryNonceCache::new(nonce_ttl)),
                )
            }
        };

    let node = EthNodeClient::new(
        settings.dispatcher.request_timeout(),
        settings.dispatcher.known_tx_patterns.clone(),
    )?;
    let registry = ConfigChainRegistry::from_settings(&settings)?;
    let key_manager = LocalKeyManager::from_env(&settings.wallet.private_keys_env)
        .context("Failed to load signing keys")?;
    info!("Signing accounts: {:?}", key_manager.accounts());

    let services = Arc::new(Services::new(
        &settings.dispatcher,
        &settings.gas,
        Collaborators {
            registry: Arc::new(registry),
            store: store.clone(),
            node: Arc::new(node),
            key_manager: Arc::new(key_manager),
            nonce_cache,
        },
    ));

    let shutdown = CancellationToken::new();

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let store = store.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = api::run_server(config, store, shutdown).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start dispatcher
    let dispatcher_handle = tokio::spawn({
        let services = services.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = services.run_dispatcher(shutdown).await {
                error!("Dispatcher error: {}", e);
            }
        }
    });

    info!("Transaction dispatcher is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");
    shutdown.cancel();

    // In-flight messages are left unacknowledged and redelivered on the next start
    let mut handles = vec![dispatcher_handle, api_handle];
    handles.extend(metrics_handle);
    for result in join_all(handles).await {
        if let Err(e) = result {
            error!("Task panicked during shutdown: {}", e);
        }
    }

    info!("Transaction dispatcher stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,tx_dispatcher=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
