use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_test::{assert_err, assert_ok};
use tokio::sync::broadcast;
use ulid::Ulid;

use parkslot::clock::ManualClock;
use parkslot::config::EngineConfig;
use parkslot::engine::{Engine, EngineError, ErrorKind};
use parkslot::model::*;
use parkslot::notify::{Notification, NotifyHub};
use parkslot::reaper;

/// 2030-03-01T00:00:00Z
const DAY: Ms = 1_898_553_600_000;
const MIN: Ms = 60_000;

// ── Test infrastructure ──────────────────────────────────────

struct Harness {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    hub: Arc<NotifyHub>,
    dir: PathBuf,
}

fn boot(dir: Option<PathBuf>) -> Harness {
    let dir = dir.unwrap_or_else(|| {
        let d = std::env::temp_dir().join(format!("parkslot_int_test_{}", Ulid::new()));
        std::fs::create_dir_all(&d).unwrap();
        d
    });
    let clock = Arc::new(ManualClock::new(DAY + 7 * HOUR_MS));
    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(dir.join("parkslot.wal"), hub.clone(), clock.clone(), EngineConfig::default()).unwrap();
    Harness {
        engine: Arc::new(engine),
        clock,
        hub,
        dir,
    }
}

async fn garage(engine: &Engine, spaces: usize) -> ParkingLocation {
    engine
        .create_location(NewLocation {
            name: "Durbar Marg Garage".into(),
            hourly_rate: 80,
            operating_hours: OperatingHours::always(),
            admins: vec!["attendant".into()],
            spaces: (1..=spaces)
                .map(|i| NewSpace {
                    space_id: format!("P{i}"),
                    space_type: SpaceType::Regular,
                })
                .collect(),
        })
        .await
        .unwrap()
}

fn booking(user: &str, loc: Ulid, space: &str, start: Ms, end: Ms, method: PaymentMethod) -> BookingRequest {
    BookingRequest {
        user_id: user.into(),
        location_id: loc,
        space_id: space.into(),
        vehicle: VehicleInfo::new("ga 1 ja 77", VehicleType::Car),
        span: Span::new(start, end),
        payment_method: method,
    }
}

/// Wait for a notification with timeout.
async fn recv_notification(rx: &mut broadcast::Receiver<Notification>, timeout: Duration) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().and_then(|r| r.ok())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn gateway_paid_booking_runs_full_lifecycle() {
    let h = boot(None);
    let loc = garage(&h.engine, 2).await;
    let mut rx = h.hub.subscribe(loc.id);

    let start = DAY + 9 * HOUR_MS;
    let b = h
        .engine
        .create_booking(booking("sita", loc.id, "P1", start, start + 2 * HOUR_MS, PaymentMethod::Card))
        .await
        .unwrap();
    assert_eq!(b.status, BookingStatus::Pending);
    assert_eq!(b.total_amount, 160);

    let n = recv_notification(&mut rx, Duration::from_secs(1)).await.unwrap();
    assert_eq!(n.kind(), "booking_updated");

    h.engine.confirm_payment(b.id).await.unwrap();
    h.clock.set(start + 10 * MIN);
    h.engine.check_in(b.id, Some(&b.qr_code)).await.unwrap();
    h.clock.set(start + 2 * HOUR_MS - MIN);
    let done = h.engine.check_out(b.id).await.unwrap();

    assert_eq!(done.status, BookingStatus::Completed);
    assert_eq!(done.payment_status, PaymentStatus::Completed);
    assert!(done.penalties.is_empty());
    assert_eq!(done.actual_duration_hours(), 2);

    let mut kinds = Vec::new();
    while let Some(n) = recv_notification(&mut rx, Duration::from_millis(50)).await {
        kinds.push(n.kind());
    }
    assert!(kinds.contains(&"payment_updated"));
    assert!(kinds.contains(&"space_updated"));
    assert_eq!(kinds.last(), Some(&"availability_updated"));

    let occ = h.engine.get_location(loc.id).await.unwrap();
    assert_eq!(occ.available_spaces, 2);
}

#[tokio::test]
async fn notification_payload_is_tagged_json() {
    let h = boot(None);
    let loc = garage(&h.engine, 1).await;
    let mut all = h.hub.subscribe_all();

    h.engine
        .set_space_status(loc.id, "P1", SpaceStatus::Maintenance, "attendant")
        .await
        .unwrap();

    let n = recv_notification(&mut all, Duration::from_secs(1)).await.unwrap();
    let parsed: serde_json::Value = serde_json::to_value(&n).unwrap();
    assert_eq!(parsed["type"], "space_updated");
    assert_eq!(parsed["status"], "maintenance");
    assert_eq!(parsed["location_id"], loc.id.to_string());

    let n = recv_notification(&mut all, Duration::from_secs(1)).await.unwrap();
    let parsed: serde_json::Value = serde_json::to_value(&n).unwrap();
    assert_eq!(parsed["type"], "availability_updated");
    assert_eq!(parsed["available_spaces"], 0);
    assert_eq!(parsed["occupancy_percentage"], 100.0);
}

#[tokio::test]
async fn notification_only_on_subscribed_location() {
    let h = boot(None);
    let a = garage(&h.engine, 1).await;
    let b = garage(&h.engine, 1).await;
    let mut rx_a = h.hub.subscribe(a.id);

    h.engine
        .create_booking(booking("ram", b.id, "P1", DAY + 9 * HOUR_MS, DAY + 10 * HOUR_MS, PaymentMethod::Cash))
        .await
        .unwrap();
    assert!(recv_notification(&mut rx_a, Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn concurrent_requests_for_one_space_admit_one() {
    let h = boot(None);
    let loc = garage(&h.engine, 1).await;
    let start = DAY + 12 * HOUR_MS;

    let attempts = (0..32).map(|i| {
        let engine = h.engine.clone();
        let user = format!("driver{i}");
        async move {
            engine
                .create_booking(booking(&user, loc.id, "P1", start, start + HOUR_MS, PaymentMethod::Cash))
                .await
        }
    });
    let results = join_all(attempts).await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1);
    for r in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(r.kind(), ErrorKind::Conflict);
    }
    let stored = h.engine.list_space_bookings(loc.id, "P1").await.unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn concurrent_staggered_requests_never_overlap() {
    let h = boot(None);
    let loc = garage(&h.engine, 3).await;

    let attempts = (0..60).map(|i| {
        let engine = h.engine.clone();
        let space = format!("P{}", i % 3 + 1);
        let start = DAY + 8 * HOUR_MS + (i as i64) * 20 * MIN;
        async move {
            engine
                .create_booking(booking("fleet", loc.id, &space, start, start + HOUR_MS, PaymentMethod::Cash))
                .await
        }
    });
    let results = join_all(attempts).await;
    assert!(results.iter().any(|r| r.is_ok()));
    assert!(results
        .iter()
        .all(|r| matches!(r, Ok(_) | Err(EngineError::Conflict { .. }))));

    for space in ["P1", "P2", "P3"] {
        let mut bookings = h.engine.list_space_bookings(loc.id, space).await.unwrap();
        bookings.retain(|b| b.status.blocks_space());
        for pair in bookings.windows(2) {
            assert!(pair[0].span.end <= pair[1].span.start, "overlap on {space}");
        }
    }
}

#[tokio::test]
async fn reaper_expires_and_frees_the_space() {
    let h = boot(None);
    let loc = garage(&h.engine, 1).await;
    let start = DAY + 8 * HOUR_MS;
    let b = h
        .engine
        .create_booking(booking("hari", loc.id, "P1", start, start + HOUR_MS, PaymentMethod::Cash))
        .await
        .unwrap();
    assert_eq!(h.engine.get_location(loc.id).await.unwrap().available_spaces, 0);

    h.clock.set(start + HOUR_MS + 1);
    assert_eq!(reaper::sweep_once(&h.engine).await, 1);
    assert_eq!(reaper::sweep_once(&h.engine).await, 0);
    let err = assert_err!(h.engine.check_in(b.id, None).await);
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);

    let expired = h.engine.get_booking(b.id).await.unwrap();
    assert_eq!(expired.status, BookingStatus::Expired);
    assert_eq!(h.engine.get_location(loc.id).await.unwrap().available_spaces, 1);
}

#[tokio::test]
async fn restart_after_compaction_keeps_history() {
    let h = boot(None);
    let loc = garage(&h.engine, 2).await;
    let start = DAY + 10 * HOUR_MS;

    let kept = h
        .engine
        .create_booking(booking("gita", loc.id, "P1", start, start + HOUR_MS, PaymentMethod::Cash))
        .await
        .unwrap();
    let cancelled = h
        .engine
        .create_booking(booking("gita", loc.id, "P2", start, start + HOUR_MS, PaymentMethod::Esewa))
        .await
        .unwrap();
    assert_ok!(h.engine.cancel_booking(cancelled.id, "gita", None).await);
    assert_ok!(h.engine.compact_wal().await);
    assert_ok!(h.engine.extend_booking(kept.id, "gita", start + 2 * HOUR_MS).await);

    let dir = h.dir.clone();
    drop(h);

    let h = boot(Some(dir));
    let listed = h.engine.list_user_bookings("gita").await;
    assert_eq!(listed.len(), 2);
    let kept = h.engine.get_booking(kept.id).await.unwrap();
    assert_eq!(kept.span.end, start + 2 * HOUR_MS);
    assert_eq!(kept.total_amount, 160);
    assert_eq!(
        h.engine.get_booking(cancelled.id).await.unwrap().status,
        BookingStatus::Cancelled
    );
    let loc = h.engine.get_location(loc.id).await.unwrap();
    assert_eq!(loc.space("P1").unwrap().held_by, Some(kept.id));
}
