//! Rota Pool - Entry Point
//!
//! Loads endpoints from the record store, keeps them probed and scored, and
//! shuts the pool down gracefully on Ctrl+C or SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rota_pool::config::{Config, LogConfig, StoreBackend};
use rota_pool::models::EndpointConfig;
use rota_pool::notify::{TracingMetricsSink, TracingNotifier};
use rota_pool::pool::{Collaborators, ConnectProbe, PoolManager};
use rota_pool::store::{MemoryRecordStore, PgRecordStore, RecordStore};
use rota_pool::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    init_tracing(&config.log);

    info!("Starting Rota pool");

    let (store, db): (Arc<dyn RecordStore>, Option<Database>) = match config.store.backend {
        StoreBackend::Postgres => {
            let db = Database::new(&config.database)
                .await
                .context("connecting to database")?;
            db.run_migrations().await.context("running migrations")?;
            let latency = db.health_check().await.context("database health check")?;
            info!(latency_ms = latency.as_millis() as u64, "Database reachable");

            let store = PgRecordStore::new(db.pool().clone());
            seed_postgres(&store, &config.store.seed_endpoints).await;
            (Arc::new(store), Some(db))
        }
        StoreBackend::Memory => {
            info!(
                seeds = config.store.seed_endpoints.len(),
                "Using in-memory record store"
            );
            (
                Arc::new(MemoryRecordStore::from_seed(&config.store.seed_endpoints)),
                None,
            )
        }
    };

    let probe = ConnectProbe::from_url(&config.pool.probe.target_url)
        .context("parsing PROBE_TARGET_URL")?;
    let collaborators = Collaborators {
        store,
        notifier: Arc::new(TracingNotifier),
        metrics: Arc::new(TracingMetricsSink),
        probe: Arc::new(probe),
    };

    let manager = PoolManager::start(config.pool.clone(), collaborators)
        .await
        .context("starting pool")?;
    let counts = manager.counts();
    info!(
        endpoints = counts.total(),
        strategy = manager.strategy(),
        "Pool started"
    );

    shutdown_signal().await;
    info!("Shutdown signal received");

    manager.shutdown().await;
    if let Some(db) = db {
        db.close().await;
    }

    info!("Rota pool stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rota_pool={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("pretty") {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

/// Insert configured seed endpoints that the database does not hold yet
async fn seed_postgres(store: &PgRecordStore, seeds: &[String]) {
    for raw in seeds {
        let config = match EndpointConfig::parse(raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(endpoint = %raw, error = %e, "Skipping invalid seed endpoint");
                continue;
            }
        };
        if let Err(e) = store.insert_endpoint(&config).await {
            warn!(endpoint = %config.id(), error = %e, "Failed to seed endpoint");
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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
