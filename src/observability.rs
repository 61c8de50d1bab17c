use std::net::SocketAddr;

// ── Booking flow ────────────────────────────────────────────────

/// Counter: bookings admitted.
pub const BOOKINGS_CREATED_TOTAL: &str = "parkslot_bookings_created_total";

/// Counter: requests rejected because the window overlapped a booking.
pub const CONFLICTS_REJECTED_TOTAL: &str = "parkslot_conflicts_rejected_total";

/// Counter: committed booking writes. Labels: status (the status after the write).
pub const BOOKING_TRANSITIONS_TOTAL: &str = "parkslot_booking_transitions_total";

/// Counter: bookings expired by reconciliation (sweep or read).
pub const BOOKINGS_EXPIRED_TOTAL: &str = "parkslot_bookings_expired_total";

/// Counter: notifications the sink refused. Labels: kind.
pub const NOTIFY_FAILURES_TOTAL: &str = "parkslot_notify_failures_total";

/// Histogram: reaper sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "parkslot_sweep_duration_seconds";

// ── Persistence ─────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkslot_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "parkslot_wal_compactions_total";

/// Gauge: locations loaded.
pub const LOCATIONS_ACTIVE: &str = "parkslot_locations_active";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
