use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use booker::config::{Config, StorageKind};
use booker::engine::BookingService;
use booker::store::{run_compactor, MemoryStore, WalStore};
use booker::sweeper::run_sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    booker::observability::init(config.metrics_port);

    let mut background: Vec<JoinHandle<()>> = Vec::new();
    let service = match config.storage {
        StorageKind::Wal => {
            std::fs::create_dir_all(&config.data_dir)?;
            let store = Arc::new(WalStore::open(config.wal_path())?);
            background.push(tokio::spawn(run_compactor(
                store.clone(),
                config.compact_threshold,
            )));
            BookingService::from_config(store.clone(), store, &config)
        }
        StorageKind::Memory => {
            let store = Arc::new(MemoryStore::new());
            BookingService::from_config(store.clone(), store, &config)
        }
    };
    let service = Arc::new(service);
    background.push(tokio::spawn(run_sweeper(
        service.clone(),
        config.sweep_interval,
    )));

    info!("booker started");
    info!("  storage: {:?} ({})", config.storage, config.data_dir.display());
    info!("  admission permits: {}", config.admission_permits);
    info!("  lock granularity: {:?}", config.lock_granularity);
    info!("  sweep interval: {:?}", config.sweep_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    shutdown_signal().await;
    info!("shutdown signal received, stopping background tasks");
    for task in background {
        task.abort();
    }

    let (users, resources, active) = (
        service.count_users().await?,
        service.count_resources().await?,
        service
            .count_by_status(booker::model::BookingStatus::Active)
            .await?,
    );
    info!("booker stopped ({users} users, {resources} resources, {active} active bookings)");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
