use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// One expiry pass: persist every booking whose reconciled status is expired.
/// Returns how many bookings were expired.
pub async fn sweep_once(engine: &Engine) -> usize {
    let started = std::time::Instant::now();
    let now = engine.now();
    let mut expired = 0;
    for booking_id in engine.collect_expirable(now) {
        match engine.expire_booking(booking_id).await {
            Ok(Some(_)) => expired += 1,
            Ok(None) => debug!("reaper skip {booking_id}: no longer due"),
            // May have been checked out or cancelled meanwhile
            Err(e) => debug!("reaper skip {booking_id}: {e}"),
        }
    }
    metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if expired > 0 {
        info!("reaper expired {expired} booking(s)");
    }
    expired
}

/// Background task that periodically expires overdue bookings.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

/// Background task that compacts the WAL once enough commits pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
                info!("compacted WAL after {appends} commits");
            }
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
