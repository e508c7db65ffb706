//! Zartan - Entry Point
//!
//! Starts the job runner, the analysis scheduler and the API server with
//! graceful shutdown support.

use std::sync::Arc;
use std::time::Instant;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use zartan::api::{ApiServer, AppState};
use zartan::clock::{Clock, SystemClock};
use zartan::config::LogConfig;
use zartan::fast_store::{AdvisoryLock, FastStore, Keys, RedisFastStore};
use zartan::health::{EvictionPolicy, HealthTracker};
use zartan::jobs::{JobQueue, JobRunner, LocalJobQueue};
use zartan::lease::LeaseCache;
use zartan::pool::ProxyPool;
use zartan::requestor::ProxyRequestor;
use zartan::services::{AnalysisScheduler, AnalysisSchedulerConfig, AnalysisSchedulerHandle};
use zartan::sources::{ProviderRegistry, SourceManager, SourceSettings};
use zartan::store::{DurableStore, PgDurableStore};
use zartan::{Config, Database};

#[tokio::main]
async fn main() -> zartan::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting Zartan");

    // Durable store
    let db = Database::new(&config).await?;
    info!("Connected to database");
    db.run_migrations().await?;
    info!("Database migrations complete");

    // Fast store
    let redis = RedisFastStore::connect(&config.redis.url).await?;
    redis.health_check().await?;

    let tunables = &config.tunables;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let durable: Arc<dyn DurableStore> = Arc::new(PgDurableStore::new(&db));
    let fast: Arc<dyn FastStore> = Arc::new(redis);
    let keys = Keys::new(config.redis.namespace.clone());
    let lock = AdvisoryLock::new(
        fast.clone(),
        tunables.pool_lock_expiration,
        tunables.pool_lock_wait,
    );

    let (queue, job_rx) = LocalJobQueue::new();
    let jobs: Arc<dyn JobQueue> = Arc::new(queue);

    let pool = ProxyPool::new(
        durable.clone(),
        fast.clone(),
        lock,
        keys.clone(),
        clock.clone(),
        jobs.clone(),
    );

    // Concrete provider clients are registered here by deployments.
    let registry = Arc::new(ProviderRegistry::new());
    if registry.registered().is_empty() {
        warn!("No cloud providers registered, only static sources will supply proxies");
    }

    let sources = SourceManager::new(
        pool.clone(),
        durable.clone(),
        fast.clone(),
        keys.clone(),
        jobs.clone(),
        registry,
        clock.clone(),
        SourceSettings::from(tunables),
    );
    let requestor = ProxyRequestor::new(durable.clone(), pool.clone(), sources.clone());
    let health = HealthTracker::new(
        pool.clone(),
        durable.clone(),
        jobs.clone(),
        requestor,
        EvictionPolicy::from(tunables),
    );
    let leases = LeaseCache::new(
        pool.clone(),
        durable.clone(),
        fast.clone(),
        keys,
        tunables.client_session_timeout,
    );

    // Create shutdown channel
    let (shutdown_tx, _) = watch::channel(false);

    // Start job runner
    let runner = Arc::new(JobRunner::new(
        durable.clone(),
        jobs.clone(),
        health.clone(),
        sources,
        config.jobs.workers,
    ));
    let runner_shutdown = shutdown_tx.subscribe();
    let runner_task = tokio::spawn(runner.run(job_rx, runner_shutdown));

    // Start analysis scheduler
    let (scheduler_handle, scheduler_shutdown) = AnalysisSchedulerHandle::new();
    let scheduler = AnalysisScheduler::new(
        jobs.clone(),
        AnalysisSchedulerConfig {
            interval: tunables.global_analysis_interval,
        },
    );
    let scheduler_task = tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });

    // Start API server
    let api_server = ApiServer::new(
        config.api.clone(),
        AppState {
            durable,
            pool,
            leases,
            health,
            api_keys: Arc::new(config.api.api_keys.clone()),
            default_retry: tunables.default_retry_interval,
            started_at: Instant::now(),
        },
    );
    let api_shutdown = shutdown_tx.subscribe();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!("API server error: {}", e);
        }
    });

    if config.api.api_keys.is_empty() {
        warn!("API_KEYS is empty, every client request will be rejected");
    }
    info!("Zartan started - API: {}", config.api_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    scheduler_handle.shutdown();

    let _ = tokio::join!(api_task, scheduler_task, runner_task);

    db.close().await;
    info!("Zartan stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("zartan={},tower_http=debug", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format == "pretty" {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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
