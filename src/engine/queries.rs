use std::collections::HashSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::lifecycle::reconcile_state;
use crate::limits::*;
use crate::model::*;

use super::availability::{enumerate_slots, free_windows, occupied_at, opening_windows, project_occupancy};
use super::conflict::{find_conflicts, validate_span};
use super::{Engine, EngineError, SharedTimeline};

impl Engine {
    /// Snapshot of a location. The lock is released before returning, so
    /// callers may go on to lock timelines without inverting lock order.
    pub async fn get_location(&self, id: Ulid) -> Result<ParkingLocation, EngineError> {
        let loc = self.location(&id)?;
        let guard = loc.read().await;
        Ok(guard.clone())
    }

    pub async fn list_locations(&self) -> Vec<ParkingLocation> {
        let handles: Vec<_> = self.locations.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for loc in handles {
            out.push(loc.read().await.clone());
        }
        out.sort_by_key(|l| l.id);
        out
    }

    /// Fetch a booking, persisting any expiry that is due first.
    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let (_, mut tl_guard) = self.resolve_booking_write(&booking_id).await?;
        let current = tl_guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let now = self.now();
        if reconcile_state(&current, now, self.config.active_grace_ms).is_none() {
            return Ok(current);
        }

        let loc = self.location(&tl_guard.key.location_id)?;
        let mut loc_guard = loc.write().await;
        match self.expire_if_due(&mut tl_guard, &mut loc_guard, &current, now).await? {
            Some((expired, notifications)) => {
                drop(loc_guard);
                drop(tl_guard);
                self.publish(&notifications);
                Ok(expired)
            }
            None => Ok(current),
        }
    }

    /// Confirmed or active bookings on the space overlapping `span`.
    pub async fn find_conflicts(
        &self,
        location_id: Ulid,
        space_id: &str,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<ConflictInfo>, EngineError> {
        validate_span(&span)?;
        let tl = self.timeline(&SpaceKey::new(location_id, space_id))?;
        let guard = tl.read().await;
        Ok(find_conflicts(&guard, &span, exclude))
    }

    /// All bookings of a user, oldest start first. Statuses are reconciled
    /// against the clock in the returned copies; the sweep persists them.
    pub async fn list_user_bookings(&self, user_id: &str) -> Vec<Booking> {
        let now = self.now();
        let mut out = Vec::new();
        for tl in self.timeline_handles() {
            let guard = tl.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.user_id == user_id)
                    .map(|b| self.reconciled_view(b, now)),
            );
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    pub async fn list_space_bookings(&self, location_id: Ulid, space_id: &str) -> Result<Vec<Booking>, EngineError> {
        let now = self.now();
        let tl = self.timeline(&SpaceKey::new(location_id, space_id))?;
        let guard = tl.read().await;
        Ok(guard.bookings.iter().map(|b| self.reconciled_view(b, now)).collect())
    }

    /// Slots over the location's opening window on `date` (UTC).
    pub async fn get_available_slots(
        &self,
        location_id: Ulid,
        space_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        let loc = self.get_location(location_id).await?;
        let space = loc
            .space(space_id)
            .ok_or_else(|| EngineError::SpaceNotFound {
                location_id,
                space_id: space_id.to_string(),
            })?
            .clone();
        let window = loc.operating_hours.window_on(date);
        let tl = self.timeline(&SpaceKey::new(location_id, space_id))?;
        let guard = tl.read().await;
        Ok(enumerate_slots(
            &window,
            self.config.slot_width_ms,
            &guard,
            &space,
            loc.hourly_rate,
            &self.config.pricing,
        ))
    }

    /// Open, unbooked stretches of at least `min_duration` inside `window`.
    pub async fn free_windows(
        &self,
        location_id: Ulid,
        space_id: &str,
        window: Span,
        min_duration: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        if window.start >= window.end {
            return Err(EngineError::validation("window end must be after start"));
        }
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        if min_duration < 0 {
            return Err(EngineError::validation("minimum duration must not be negative"));
        }
        let loc = self.get_location(location_id).await?;
        if loc.space(space_id).is_some_and(|s| s.status == SpaceStatus::Maintenance) {
            return Ok(Vec::new());
        }
        let open = opening_windows(&loc.operating_hours, &window);
        let tl = self.timeline(&SpaceKey::new(location_id, space_id))?;
        let guard = tl.read().await;
        Ok(free_windows(&open, &guard, min_duration))
    }

    /// Time-window occupancy at `as_of` (default: now).
    pub async fn project_occupancy(&self, location_id: Ulid, as_of: Option<Ms>) -> Result<Occupancy, EngineError> {
        let as_of = as_of.unwrap_or_else(|| self.now());
        if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&as_of) {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        let loc = self.get_location(location_id).await?;
        let mut busy = HashSet::new();
        for space in &loc.spaces {
            let tl = self.timeline(&SpaceKey::new(location_id, space.space_id.clone()))?;
            let guard = tl.read().await;
            if occupied_at(&guard, as_of) {
                busy.insert(space.space_id.clone());
            }
        }
        Ok(project_occupancy(&loc, |s| busy.contains(&s.space_id)))
    }

    fn timeline_handles(&self) -> Vec<SharedTimeline> {
        self.timelines.iter().map(|e| e.value().clone()).collect()
    }

    fn reconciled_view(&self, b: &Booking, now: Ms) -> Booking {
        let mut view = b.clone();
        if let Some(status) = reconcile_state(b, now, self.config.active_grace_ms) {
            view.status = status;
        }
        view
    }
}
