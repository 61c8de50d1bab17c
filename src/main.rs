use std::sync::Arc;

use tracing::{info, warn};

use parkslot::clock::SystemClock;
use parkslot::config::Config;
use parkslot::engine::Engine;
use parkslot::model::NewLocation;
use parkslot::notify::NotifyHub;
use parkslot::reaper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    parkslot::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        hub.clone(),
        Arc::new(SystemClock),
        config.engine.clone(),
    )?);

    if let Some(seed) = &config.seed_file {
        if engine.list_locations().await.is_empty() {
            let raw = std::fs::read_to_string(seed)?;
            let locations: Vec<NewLocation> = serde_json::from_str(&raw)?;
            for new in locations {
                let name = new.name.clone();
                match engine.create_location(new).await {
                    Ok(loc) => info!("seeded location {name} as {}", loc.id),
                    Err(e) => warn!("skipping seed location {name}: {e}"),
                }
            }
        } else {
            info!("locations already present, ignoring seed file");
        }
    }

    info!("parkslot started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  locations: {}", engine.list_locations().await.len());
    info!("  sweep every {:?}, compact after {} commits", config.sweep_interval, config.compact_threshold);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let reaper_task = tokio::spawn(reaper::run_reaper(engine.clone(), config.sweep_interval));
    let compactor_task = tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));

    // Log every notification; an outer transport would subscribe the same way.
    let mut feed = hub.subscribe_all();
    let feed_task = tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(n) => match serde_json::to_string(&n) {
                    Ok(json) => info!(target: "parkslot::notify", "{json}"),
                    Err(e) => warn!("unserializable notification: {e}"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("notification log lagged, {missed} dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Graceful shutdown: stop background tasks on SIGTERM/ctrl-c, compact, exit
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("cannot listen for SIGTERM ({e}), waiting for ctrl-c only");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;
    info!("shutdown signal received, stopping background tasks");

    reaper_task.abort();
    compactor_task.abort();
    feed_task.abort();

    match engine.compact_wal().await {
        Ok(()) => info!("WAL compacted"),
        Err(e) => warn!("final WAL compaction failed: {e}"),
    }

    info!("parkslot stopped");
    Ok(())
}
