//! Tokenmeter reconciliation job.
//!
//! Runs one reconciliation pass and exits, or loops when
//! `RECONCILE_INTERVAL_SECONDS` is set.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokenmeter_core::ModelRegistry;
use tokenmeter_service::{CreditService, ReconcileWorker, StoreBackend, WorkerConfig};
use tokenmeter_store::{MemoryStore, MessageStore, PgStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tokenmeter=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting tokenmeter reconciliation");

    // Load configuration from environment
    let config = WorkerConfig::from_env()?;
    let registry = Arc::new(config.load_registry()?);

    tracing::info!(
        backend = %config.store_backend,
        stuck_age_minutes = config.stuck_age_minutes,
        interval_seconds = ?config.reconcile_interval.map(|d| d.as_secs()),
        models = registry.model_ids().len(),
        "Worker configuration loaded"
    );

    match config.store_backend {
        StoreBackend::Postgres => {
            tracing::info!("Connecting to PostgreSQL");
            let store =
                PgStore::connect(&config.database_url, config.database_max_connections).await?;
            store.migrate().await?;
            run(Arc::new(store), registry, &config).await
        }
        StoreBackend::RocksDb => open_rocks(registry, &config).await,
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; nothing persists");
            run(Arc::new(MemoryStore::new()), registry, &config).await
        }
    }
}

#[cfg(feature = "rocksdb-backend")]
async fn open_rocks(
    registry: Arc<ModelRegistry>,
    config: &WorkerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    let store = tokenmeter_store::RocksStore::open(&config.data_dir)?;
    run(Arc::new(store), registry, config).await
}

#[cfg(not(feature = "rocksdb-backend"))]
async fn open_rocks(
    _registry: Arc<ModelRegistry>,
    _config: &WorkerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    Err("STORE_BACKEND=rocksdb requires the rocksdb-backend feature".into())
}

async fn run<S>(
    store: Arc<S>,
    registry: Arc<ModelRegistry>,
    config: &WorkerConfig,
) -> Result<(), Box<dyn std::error::Error>>
where
    S: Store + MessageStore + 'static,
{
    let credits = CreditService::new(Arc::clone(&store), registry);
    let worker = ReconcileWorker::new(credits, store, config.stuck_age_minutes);

    match config.reconcile_interval {
        Some(period) => {
            tracing::info!(interval_seconds = period.as_secs(), "Running reconciliation loop");
            worker
                .run_periodically(period, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Failed to listen for shutdown signal");
                    }
                })
                .await;
        }
        None => {
            let report = worker.run_once().await?;
            tracing::info!(
                completed = report.completed,
                failed = report.failed,
                skipped = report.skipped,
                "Reconciliation complete"
            );
        }
    }

    Ok(())
}
