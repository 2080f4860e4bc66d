mod api;
mod config;
mod error;
mod metrics;
mod models;
mod queue;
mod sandbox;
mod store;
mod worker;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{BackendConfig, EngineConfig, LogFormat},
    metrics::MetricsRegistry,
    queue::{JobQueue, in_memory::InMemoryQueueBackend, redis_backend::RedisQueueBackend},
    sandbox::{SandboxExecutor, SandboxFactory},
    store::{ResultStore, in_memory::InMemoryResultBackend, redis_backend::RedisResultBackend},
    worker::{WorkerContext, spawn_worker_pool},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("failed to build engine config")?;
    init_tracing(&config);

    let (queue, store) = build_backends(&config).await?;
    tracing::info!(
        queue = queue.backend_name(),
        store = store.backend_name(),
        result_ttl_secs = store.ttl().as_secs(),
        "backends ready"
    );
    let metrics = Arc::new(MetricsRegistry::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::new();
    if config.run_mode.runs_workers() {
        let backend = SandboxFactory::from_config(&config.sandbox)
            .context("sandbox backend init failed")?;
        let executor = Arc::new(SandboxExecutor::from_config(backend, &config.sandbox));
        if let Err(err) = executor.prepare().await {
            tracing::warn!(
                backend = executor.backend_name(),
                error = %err,
                "sandbox warm-up failed; jobs will record errors until the runtime recovers"
            );
        }

        workers = spawn_worker_pool(
            config.worker_count,
            WorkerContext {
                queue: queue.clone(),
                store: store.clone(),
                executor,
                metrics: metrics.clone(),
                config: config.worker.clone(),
                claim_ttl: config.claim_ttl(),
            },
            shutdown_rx,
        );
        tracing::info!(workers = workers.len(), "worker pool started");
    }

    if config.run_mode.runs_api() {
        let app = api::routes(queue, store, metrics, config.max_code_bytes);
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .context("failed to bind listener")?;
        let local = listener
            .local_addr()
            .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
        tracing::info!(bind = %local, "sandbox intake listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("intake server error")?;
    } else {
        shutdown_signal().await;
    }

    tracing::info!("shutting down; letting in-flight jobs finish");
    // Receivers may already be gone if every worker exited early.
    let _ = shutdown_tx.send(true);
    for handle in workers {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "worker task failed");
        }
    }

    Ok(())
}

async fn build_backends(config: &EngineConfig) -> anyhow::Result<(JobQueue, ResultStore)> {
    match &config.backend {
        BackendConfig::InMemory => {
            tracing::info!("using in-process queue and result store");
            Ok((
                JobQueue::new(Arc::new(InMemoryQueueBackend::new())),
                ResultStore::new(
                    Arc::new(InMemoryResultBackend::new()),
                    "sandbox",
                    config.result_ttl,
                ),
            ))
        }
        BackendConfig::Redis { url, key_prefix } => {
            let client = redis::Client::open(url.as_str()).context("invalid REDIS_URL")?;
            let manager = client
                .get_connection_manager()
                .await
                .context("failed to connect to redis")?;
            let mut conn = manager.clone();
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .context("redis ping failed")?;
            tracing::info!(prefix = %key_prefix, "connected to redis");

            Ok((
                JobQueue::new(Arc::new(RedisQueueBackend::new(manager.clone(), key_prefix))),
                ResultStore::new(
                    Arc::new(RedisResultBackend::new(manager)),
                    key_prefix.clone(),
                    config.result_ttl,
                ),
            ))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match config.log_format {
        LogFormat::Json => builder
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
        LogFormat::Compact => builder.compact().init(),
    }
}
