mod availability;
mod bookings;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{
    enumerate_slots, free_windows, merge_overlapping, occupied_at, opening_windows, project_occupancy,
    subtract_intervals,
};
pub use bookings::CancelOutcome;
pub use conflict::find_conflicts;
pub use error::{EngineError, ErrorKind};
pub use mutations::{SpaceUpdateOutcome, SpaceUpdateResult};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::{Notification, NotificationSink};
use crate::retry::{retry_transient, RetryPolicy};
use crate::wal::Wal;

pub type SharedLocation = Arc<RwLock<ParkingLocation>>;
pub type SharedTimeline = Arc<RwLock<SpaceTimeline>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingCommit = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }
                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingCommit>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingCommit]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let _ = response.send(compact(wal));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Rewrite the log as a snapshot. Runs inside the writer task, so no append
/// can interleave between reading the log and swapping the file.
fn compact(wal: &mut Wal) -> io::Result<()> {
    wal.flush_sync()?;
    let events = Wal::replay(wal.path())?;
    let snapshot = snapshot_events(events);
    Wal::write_compact_file(wal.path(), &snapshot)?;
    wal.swap_compact_file()
}

/// Fold an event history into the minimal events that recreate its final
/// state: every location as created-with-current-spaces, then every booking
/// in its latest form. Creation order is preserved.
pub(crate) fn snapshot_events(events: Vec<Event>) -> Vec<Event> {
    let mut location_order: Vec<Ulid> = Vec::new();
    let mut locations: HashMap<Ulid, ParkingLocation> = HashMap::new();
    let mut booking_order: Vec<Ulid> = Vec::new();
    let mut bookings: HashMap<Ulid, Booking> = HashMap::new();

    for event in events {
        match event {
            Event::LocationCreated { location } => {
                if !locations.contains_key(&location.id) {
                    location_order.push(location.id);
                }
                locations.insert(location.id, location);
            }
            Event::BookingCreated { booking } | Event::BookingUpdated { booking } => {
                if !bookings.contains_key(&booking.id) {
                    booking_order.push(booking.id);
                }
                bookings.insert(booking.id, booking);
            }
            other => {
                if let Some(lid) = location_event_target(&other)
                    && let Some(loc) = locations.get_mut(&lid)
                {
                    apply_to_location(loc, &other);
                }
            }
        }
    }

    let mut out = Vec::with_capacity(location_order.len() + booking_order.len());
    for id in location_order {
        if let Some(location) = locations.remove(&id) {
            out.push(Event::LocationCreated { location });
        }
    }
    for id in booking_order {
        if let Some(booking) = bookings.remove(&id) {
            out.push(Event::BookingCreated { booking });
        }
    }
    out
}

fn location_event_target(event: &Event) -> Option<Ulid> {
    match event {
        Event::LocationUpdated { id, .. } => Some(*id),
        Event::SpaceAdded { location_id, .. } | Event::SpaceStatusChanged { location_id, .. } => {
            Some(*location_id)
        }
        Event::LocationCreated { .. } | Event::BookingCreated { .. } | Event::BookingUpdated { .. } => None,
    }
}

/// Apply a location-scoped event (caller holds the lock).
/// Every space-status write recounts `available_spaces` before returning.
fn apply_to_location(loc: &mut ParkingLocation, event: &Event) {
    match event {
        Event::LocationUpdated {
            name,
            hourly_rate,
            operating_hours,
            is_active,
            ..
        } => {
            loc.name = name.clone();
            loc.hourly_rate = *hourly_rate;
            loc.operating_hours = *operating_hours;
            loc.is_active = *is_active;
        }
        Event::SpaceAdded { space, .. } => {
            loc.spaces.push(space.clone());
            loc.recount_available();
        }
        Event::SpaceStatusChanged {
            space_id,
            status,
            held_by,
            ..
        } => {
            if let Some(space) = loc.space_mut(space_id) {
                space.status = *status;
                space.held_by = *held_by;
            }
            loc.recount_available();
        }
        Event::LocationCreated { .. } | Event::BookingCreated { .. } | Event::BookingUpdated { .. } => {}
    }
}

/// Apply a booking event to its space timeline (caller holds the lock).
fn apply_to_timeline(tl: &mut SpaceTimeline, event: &Event, index: &DashMap<Ulid, SpaceKey>) {
    match event {
        Event::BookingCreated { booking } => {
            index.insert(booking.id, tl.key.clone());
            tl.insert_booking(booking.clone());
        }
        Event::BookingUpdated { booking } => {
            if !tl.replace_booking(booking.clone()) {
                index.insert(booking.id, tl.key.clone());
                tl.insert_booking(booking.clone());
            }
        }
        _ => {}
    }
}

pub struct Engine {
    pub(super) locations: DashMap<Ulid, SharedLocation>,
    pub(super) timelines: DashMap<SpaceKey, SharedTimeline>,
    /// Reverse lookup: booking id → space timeline.
    pub(super) booking_index: DashMap<Ulid, SpaceKey>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) notify: Arc<dyn NotificationSink>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            locations: DashMap::new(),
            timelines: DashMap::new(),
            booking_index: DashMap::new(),
            wal_tx,
            notify,
            clock,
            config,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this may run inside an async context.
        for event in &events {
            match event {
                Event::LocationCreated { location } => engine.insert_location(location.clone()),
                Event::BookingCreated { booking } | Event::BookingUpdated { booking } => {
                    if let Some(tl) = engine.timelines.get(&booking.key()).map(|e| e.value().clone())
                        && let Ok(mut guard) = tl.try_write()
                    {
                        apply_to_timeline(&mut guard, event, &engine.booking_index);
                    }
                }
                other => {
                    let Some(lid) = location_event_target(other) else { continue };
                    if let Some(loc) = engine.locations.get(&lid).map(|e| e.value().clone())
                        && let Ok(mut guard) = loc.try_write()
                    {
                        apply_to_location(&mut guard, other);
                        if let Event::SpaceAdded { space, .. } = other {
                            engine.insert_timeline(SpaceKey::new(lid, space.space_id.clone()));
                        }
                    }
                }
            }
        }

        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(super) fn insert_location(&self, location: ParkingLocation) {
        for space in &location.spaces {
            self.insert_timeline(SpaceKey::new(location.id, space.space_id.clone()));
        }
        self.locations.insert(location.id, Arc::new(RwLock::new(location)));
        metrics::gauge!(crate::observability::LOCATIONS_ACTIVE).set(self.locations.len() as f64);
    }

    pub(super) fn insert_timeline(&self, key: SpaceKey) {
        self.timelines
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(SpaceTimeline::new(key))));
    }

    /// Write one commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durably commit the events of one transition. Callers apply them to
    /// in-memory state only after this returns Ok.
    pub(super) async fn commit(&self, events: &[Event], retry: &RetryPolicy) -> Result<(), EngineError> {
        retry_transient(retry, "wal commit", || self.wal_append(events)).await
    }

    pub(super) async fn commit_once(&self, events: &[Event]) -> Result<(), EngineError> {
        self.commit(events, &RetryPolicy::none()).await
    }

    pub(super) fn location(&self, id: &Ulid) -> Result<SharedLocation, EngineError> {
        self.locations
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::LocationNotFound(*id))
    }

    pub(super) fn timeline(&self, key: &SpaceKey) -> Result<SharedTimeline, EngineError> {
        if !self.locations.contains_key(&key.location_id) {
            return Err(EngineError::LocationNotFound(key.location_id));
        }
        self.timelines
            .get(key)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::SpaceNotFound {
                location_id: key.location_id,
                space_id: key.space_id.clone(),
            })
    }

    pub fn get_timeline_for_booking(&self, booking_id: &Ulid) -> Option<SpaceKey> {
        self.booking_index.get(booking_id).map(|e| e.value().clone())
    }

    /// Lookup booking → space timeline, acquire its write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(SpaceKey, OwnedRwLockWriteGuard<SpaceTimeline>), EngineError> {
        let key = self
            .get_timeline_for_booking(booking_id)
            .ok_or(EngineError::BookingNotFound(*booking_id))?;
        let tl = self.timeline(&key)?;
        let guard = tl.write_owned().await;
        Ok((key, guard))
    }

    /// Apply committed booking events to a held timeline.
    pub(super) fn apply_booking_events(&self, tl: &mut SpaceTimeline, events: &[Event]) {
        for event in events {
            apply_to_timeline(tl, event, &self.booking_index);
        }
    }

    /// Apply committed location events to a held location.
    pub(super) fn apply_location_events(&self, loc: &mut ParkingLocation, events: &[Event]) {
        for event in events {
            apply_to_location(loc, event);
        }
    }

    /// Fan out notifications. Only ever called after the write is committed;
    /// a failing sink is logged and otherwise ignored.
    pub(super) fn publish(&self, notifications: &[Notification]) {
        for n in notifications {
            if let Err(e) = self.notify.publish(n) {
                metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL, "kind" => n.kind())
                    .increment(1);
                warn!("dropping {} notification for {}: {e}", n.kind(), n.location_id());
            }
        }
    }

    /// Publish a committed write, then follow each location whose space
    /// status changed with its projected availability. Call with no locks held.
    pub(super) async fn publish_committed(&self, notifications: &[Notification]) {
        self.publish(notifications);
        let mut changed: Vec<Ulid> = Vec::new();
        for n in notifications {
            if let Notification::SpaceUpdated { location_id, .. } = n
                && !changed.contains(location_id)
            {
                changed.push(*location_id);
            }
        }
        for location_id in changed {
            match self.project_occupancy(location_id, None).await {
                Ok(occ) => self.publish(&[availability_notification(&occ)]),
                Err(e) => warn!("no availability update for {location_id}: {e}"),
            }
        }
    }

    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

pub(super) fn ensure_admin(loc: &ParkingLocation, actor: &str, action: &'static str) -> Result<(), EngineError> {
    if loc.is_admin(actor) {
        Ok(())
    } else {
        Err(EngineError::Permission {
            actor: actor.to_string(),
            action,
        })
    }
}

pub(super) fn booking_notification(b: &Booking) -> Notification {
    Notification::BookingUpdated {
        booking_id: b.id,
        user_id: b.user_id.clone(),
        location_id: b.location_id,
        space_id: b.space_id.clone(),
        status: b.status,
    }
}

pub(super) fn payment_notification(b: &Booking) -> Notification {
    Notification::PaymentUpdated {
        booking_id: b.id,
        user_id: b.user_id.clone(),
        location_id: b.location_id,
        payment_status: b.payment_status,
    }
}

pub(super) fn availability_notification(occ: &Occupancy) -> Notification {
    Notification::AvailabilityUpdated {
        location_id: occ.location_id,
        available_spaces: occ.available_spaces,
        occupancy_percentage: occ.occupancy_percentage,
    }
}

/// Space-status notifications for every status change in a commit.
pub(super) fn space_notifications(events: &[Event]) -> Vec<Notification> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::SpaceStatusChanged {
                location_id,
                space_id,
                status,
                ..
            } => Some(Notification::SpaceUpdated {
                location_id: *location_id,
                space_id: space_id.clone(),
                status: *status,
            }),
            _ => None,
        })
        .collect()
}
