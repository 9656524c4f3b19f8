use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::facility::FacilityManager;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Background task that rewrites the WAL as a snapshot once enough appends
/// have piled up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!("compaction failed: {e}");
        }
    }
}

/// Compact when `threshold` appends have accumulated. Returns whether it did.
pub async fn compact_if_needed(
    engine: &Engine,
    threshold: u64,
) -> Result<bool, crate::engine::EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Background task that audits every open facility and refreshes the
/// per-zone availability gauges.
pub async fn run_auditor(facilities: Arc<FacilityManager>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        for (name, engine) in facilities.facilities() {
            audit_facility(&name, &engine).await;
        }
    }
}

/// Audit one facility; returns the number of violations found.
pub async fn audit_facility(name: &str, engine: &Engine) -> usize {
    if engine.is_halted() {
        warn!("facility {name} is halted and rejects mutations");
    }
    for (zone, available) in engine.zone_availability().await {
        metrics::gauge!(
            crate::observability::ZONE_SLOTS_AVAILABLE,
            "facility" => name.to_string(),
            "zone" => zone.as_str().to_string()
        )
        .set(available as f64);
    }

    let violations = engine.audit().await;
    metrics::gauge!(crate::observability::AUDIT_VIOLATIONS, "facility" => name.to_string())
        .set(violations.len() as f64);
    if violations.is_empty() {
        debug!("audit {name}: consistent");
    }
    for violation in &violations {
        warn!("audit {name}: {violation}");
    }
    violations.len()
}
