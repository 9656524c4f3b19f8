use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use slotward::config::Config;
use slotward::facility::FacilityManager;
use slotward::maintenance;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    slotward::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let facilities = Arc::new(FacilityManager::new(
        config.data_dir.clone(),
        config.engine.clone(),
        config.compact_threshold,
    ));
    for name in &config.facilities {
        let engine = facilities.get_or_create(name)?;
        let health = engine.health().await;
        info!(
            "facility {name}: {}/{} slots available, {} vehicles, {} requests",
            health.slots_available, health.slots_total, health.vehicles, health.requests
        );
    }

    let auditor = tokio::spawn(maintenance::run_auditor(
        facilities.clone(),
        Duration::from_secs(config.audit_interval_secs.max(1)),
    ));

    info!("slotward running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  zones: {}", config.engine.zones.iter().map(|z| z.as_str()).collect::<Vec<_>>().join(","));
    info!("  max_undo: {}", config.engine.max_undo);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    shutdown_signal().await?;
    info!("shutdown signal received");
    auditor.abort();

    // Fold each log into a snapshot so the next start replays quickly.
    for (name, engine) in facilities.facilities() {
        if let Err(e) = engine.compact_wal().await {
            tracing::warn!("facility {name}: final compaction failed: {e}");
        }
    }

    info!("slotward stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = ctrl_c => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    Ok(())
}
