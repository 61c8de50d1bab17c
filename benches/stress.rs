use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use ulid::Ulid;

use parkslot::clock::ManualClock;
use parkslot::config::EngineConfig;
use parkslot::engine::Engine;
use parkslot::model::*;
use parkslot::notify::NotifyHub;

/// 2030-01-01T00:00:00Z
const EPOCH: Ms = 1_893_456_000_000;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

fn engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("parkslot_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let clock = Arc::new(ManualClock::new(EPOCH));
    let engine = Engine::new(dir.join(name), Arc::new(NotifyHub::new()), clock, EngineConfig::default())
        .expect("open engine");
    Arc::new(engine)
}

async fn lot(engine: &Engine, spaces: usize) -> ParkingLocation {
    engine
        .create_location(NewLocation {
            name: "Bench Lot".into(),
            hourly_rate: 100,
            operating_hours: OperatingHours::always(),
            admins: vec!["bench".into()],
            spaces: (0..spaces)
                .map(|i| NewSpace {
                    space_id: format!("S{i}"),
                    space_type: SpaceType::Regular,
                })
                .collect(),
        })
        .await
        .expect("create location")
}

fn request(loc: Ulid, space: &str, start: Ms) -> BookingRequest {
    BookingRequest {
        user_id: "bench".into(),
        location_id: loc,
        space_id: space.into(),
        vehicle: VehicleInfo::new("BENCH 1", VehicleType::Car),
        span: Span::new(start, start + HOUR_MS),
        payment_method: PaymentMethod::Cash,
    }
}

async fn phase1_sequential() {
    let engine = engine("seq.wal");
    let loc = lot(&engine, 1).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = EPOCH + HOUR_MS + (i as i64) * HOUR_MS;
        let t = Instant::now();
        engine.create_booking(request(loc.id, "S0", s)).await.expect("booking");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent() {
    let engine = engine("concurrent.wal");
    let n_tasks = 10;
    let n_per_task = 200;
    let loc = lot(&engine, n_tasks).await;

    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let engine = engine.clone();
        let space = format!("S{i}");
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                let s = EPOCH + HOUR_MS + (j as i64) * HOUR_MS;
                engine.create_booking(request(loc.id, &space, s)).await.expect("booking");
            }
        }));
    }

    for h in handles {
        h.await.expect("task");
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load() {
    let engine = engine("reads.wal");
    let loc = lot(&engine, 20).await;

    // Pre-fill the first day so slot queries have something to subtract.
    for i in 0..20 {
        for h in (1..24).step_by(2) {
            let s = EPOCH + DAY_MS + h * HOUR_MS;
            engine
                .create_booking(request(loc.id, &format!("S{i}"), s))
                .await
                .expect("prefill");
        }
    }

    // Writers keep adding bookings further out while readers query.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let engine = engine.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let space = format!("S{w}");
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let s = EPOCH + 10 * DAY_MS + i * HOUR_MS;
                let _ = engine.create_booking(request(loc.id, &space, s)).await;
                i += 1;
            }
        }));
    }

    let day = NaiveDate::from_ymd_opt(2030, 1, 2).expect("date");
    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let engine = engine.clone();
        reader_handles.push(tokio::spawn(async move {
            let space = format!("S{}", r % 20);
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for k in 0..reads_per_reader {
                let t = Instant::now();
                if k % 2 == 0 {
                    engine
                        .get_available_slots(loc.id, &space, day)
                        .await
                        .expect("slots");
                } else {
                    engine
                        .project_occupancy(loc.id, Some(EPOCH + DAY_MS + 12 * HOUR_MS))
                        .await
                        .expect("occupancy");
                }
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.expect("reader"));
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("slot/occupancy query", &mut all_latencies);
}

async fn phase4_contention_storm() {
    let engine = engine("storm.wal");
    let loc = lot(&engine, 1).await;
    let n_tasks = 50;
    let slots = 10;

    let start = Instant::now();
    let admitted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let engine = engine.clone();
        let admitted = admitted.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..slots {
                let s = EPOCH + HOUR_MS + (i as i64) * HOUR_MS;
                match engine.create_booking(request(loc.id, "S0", s)).await {
                    Ok(_) => admitted.fetch_add(1, Ordering::Relaxed),
                    Err(_) => rejected.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = admitted.load(Ordering::Relaxed);
    let no = rejected.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks racing for {slots} slots: {ok} admitted, {no} rejected in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(ok, slots, "each slot must be admitted exactly once");
}

async fn phase5_compaction() {
    let engine = engine("compact.wal");
    let loc = lot(&engine, 4).await;
    for i in 0..4 {
        for j in 0..500 {
            let s = EPOCH + HOUR_MS + (j as i64) * HOUR_MS;
            let b = engine
                .create_booking(request(loc.id, &format!("S{i}"), s))
                .await
                .expect("booking");
            if j % 2 == 0 {
                engine.cancel_booking(b.id, "bench", None).await.expect("cancel");
            }
        }
    }
    let appends = engine.wal_appends_since_compact().await;
    let t = Instant::now();
    engine.compact_wal().await.expect("compact");
    println!("  compacted {appends} commits in {:.2}ms", t.elapsed().as_secs_f64() * 1000.0);
}

#[tokio::main]
async fn main() {
    println!("=== parkslot stress benchmark ===\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential().await;

    println!("\n[phase 2] concurrent booking throughput (one space per task)");
    phase2_concurrent().await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load().await;

    println!("\n[phase 4] contention storm on one space");
    phase4_contention_storm().await;

    println!("\n[phase 5] WAL compaction");
    phase5_compaction().await;

    println!("\n=== done ===");
}
