use std::net::SocketAddr;
use std::time::Instant;

// ── RED metrics (operation-driven) ──────────────────────────────

/// Counter: total engine operations. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "slotward_operations_total";

/// Histogram: operation latency in seconds, lock wait included. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "slotward_operation_duration_seconds";

/// Counter: allocations satisfied outside the requested zone.
pub const CROSS_ZONE_ALLOCATIONS_TOTAL: &str = "slotward_cross_zone_allocations_total";

/// Histogram: ledger entries reverted per committed batch undo.
pub const UNDO_BATCH_SIZE: &str = "slotward_undo_batch_size";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: available slots. Labels: facility, zone.
pub const ZONE_SLOTS_AVAILABLE: &str = "slotward_zone_slots_available";

/// Gauge: invariant violations found by the last audit. Labels: facility.
pub const AUDIT_VIOLATIONS: &str = "slotward_audit_violations";

/// Gauge: number of open facilities (loaded engines).
pub const FACILITIES_ACTIVE: &str = "slotward_facilities_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotward_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotward_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Count one engine operation and record its latency.
pub fn record_operation(op: &'static str, ok: bool, started: Instant) {
    let status = if ok { "ok" } else { "error" };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
