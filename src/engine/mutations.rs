use std::collections::HashSet;

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;

use super::{availability_notification, ensure_admin, space_notifications, Engine, EngineError};

/// Per-item result of a bulk space-status update.
#[derive(Debug)]
pub struct SpaceUpdateResult {
    pub space_id: String,
    pub outcome: Result<SpaceStatus, EngineError>,
}

#[derive(Debug)]
pub struct SpaceUpdateOutcome {
    pub results: Vec<SpaceUpdateResult>,
    /// Projected availability once the batch is applied.
    pub occupancy: Occupancy,
}

fn validate_space_id(space_id: &str) -> Result<(), EngineError> {
    if space_id.trim().is_empty() {
        return Err(EngineError::validation("space id must not be empty"));
    }
    if space_id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("space id too long"));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::validation("location name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("location name too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_location(&self, new: NewLocation) -> Result<ParkingLocation, EngineError> {
        if self.locations.len() >= MAX_LOCATIONS {
            return Err(EngineError::LimitExceeded("too many locations"));
        }
        validate_name(&new.name)?;
        if new.hourly_rate < 0 {
            return Err(EngineError::validation("hourly rate must not be negative"));
        }
        if new.admins.len() > MAX_ADMINS_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many admins"));
        }
        if new.spaces.len() > MAX_SPACES_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many spaces"));
        }
        let mut seen = HashSet::new();
        for s in &new.spaces {
            validate_space_id(&s.space_id)?;
            if !seen.insert(s.space_id.as_str()) {
                return Err(EngineError::AlreadyExists(format!("space {}", s.space_id)));
            }
        }

        let mut location = ParkingLocation {
            id: Ulid::new(),
            name: new.name,
            hourly_rate: new.hourly_rate,
            operating_hours: new.operating_hours,
            is_active: true,
            admins: new.admins,
            spaces: new
                .spaces
                .into_iter()
                .map(|s| ParkingSpace::new(s.space_id, s.space_type))
                .collect(),
            available_spaces: 0,
        };
        location.recount_available();

        let event = Event::LocationCreated {
            location: location.clone(),
        };
        self.commit_once(std::slice::from_ref(&event)).await?;
        self.insert_location(location.clone());
        info!(
            "created location {} ({}) with {} spaces",
            location.id,
            location.name,
            location.total_spaces()
        );
        Ok(location)
    }

    pub async fn add_space(
        &self,
        location_id: Ulid,
        space_id: &str,
        space_type: SpaceType,
        actor: &str,
    ) -> Result<ParkingSpace, EngineError> {
        validate_space_id(space_id)?;
        let loc = self.location(&location_id)?;
        let mut guard = loc.write().await;
        ensure_admin(&guard, actor, "add spaces")?;
        if guard.space(space_id).is_some() {
            return Err(EngineError::AlreadyExists(format!("space {space_id}")));
        }
        if guard.spaces.len() >= MAX_SPACES_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many spaces"));
        }

        let space = ParkingSpace::new(space_id, space_type);
        let events = [Event::SpaceAdded {
            location_id,
            space: space.clone(),
        }];
        self.commit_once(&events).await?;
        self.insert_timeline(SpaceKey::new(location_id, space_id));
        self.apply_location_events(&mut guard, &events);
        drop(guard);

        let occ = self.project_occupancy(location_id, None).await?;
        self.publish(&[availability_notification(&occ)]);
        Ok(space)
    }

    pub async fn update_location(
        &self,
        location_id: Ulid,
        patch: LocationPatch,
        actor: &str,
    ) -> Result<ParkingLocation, EngineError> {
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        if let Some(rate) = patch.hourly_rate
            && rate < 0
        {
            return Err(EngineError::validation("hourly rate must not be negative"));
        }
        let loc = self.location(&location_id)?;
        let mut guard = loc.write().await;
        ensure_admin(&guard, actor, "update location")?;

        let events = [Event::LocationUpdated {
            id: location_id,
            name: patch.name.unwrap_or_else(|| guard.name.clone()),
            hourly_rate: patch.hourly_rate.unwrap_or(guard.hourly_rate),
            operating_hours: patch.operating_hours.unwrap_or(guard.operating_hours),
            is_active: patch.is_active.unwrap_or(guard.is_active),
        }];
        self.commit_once(&events).await?;
        self.apply_location_events(&mut guard, &events);
        Ok(guard.clone())
    }

    /// Administrative status write for one space. Returns the projected
    /// availability at the current time.
    pub async fn set_space_status(
        &self,
        location_id: Ulid,
        space_id: &str,
        status: SpaceStatus,
        actor: &str,
    ) -> Result<Occupancy, EngineError> {
        let notifications = self.write_space_status(location_id, space_id, status, actor).await?;
        self.publish(&notifications);
        let occ = self.project_occupancy(location_id, None).await?;
        self.publish(&[availability_notification(&occ)]);
        Ok(occ)
    }

    /// Apply each update independently. Failures are reported per item and do
    /// not stop the batch; one availability notification goes out at the end.
    pub async fn bulk_set_space_status(
        &self,
        location_id: Ulid,
        updates: Vec<SpaceStatusUpdate>,
        actor: &str,
    ) -> Result<SpaceUpdateOutcome, EngineError> {
        if updates.len() > MAX_BULK_UPDATES {
            return Err(EngineError::LimitExceeded("too many updates in batch"));
        }
        {
            let loc = self.location(&location_id)?;
            let guard = loc.read().await;
            ensure_admin(&guard, actor, "update space status")?;
        }

        let mut results = Vec::with_capacity(updates.len());
        let mut notifications = Vec::new();
        for update in updates {
            let outcome = match self
                .write_space_status(location_id, &update.space_id, update.status, actor)
                .await
            {
                Ok(mut n) => {
                    notifications.append(&mut n);
                    Ok(update.status)
                }
                Err(e) => Err(e),
            };
            results.push(SpaceUpdateResult {
                space_id: update.space_id,
                outcome,
            });
        }

        self.publish(&notifications);
        let occupancy = self.project_occupancy(location_id, None).await?;
        self.publish(&[availability_notification(&occupancy)]);
        Ok(SpaceUpdateOutcome { results, occupancy })
    }

    /// Locks timeline then location, guards maintenance, commits, recounts.
    async fn write_space_status(
        &self,
        location_id: Ulid,
        space_id: &str,
        status: SpaceStatus,
        actor: &str,
    ) -> Result<Vec<Notification>, EngineError> {
        let tl = self.timeline(&SpaceKey::new(location_id, space_id))?;
        let tl_guard = tl.read().await;
        let loc = self.location(&location_id)?;
        let mut guard = loc.write().await;
        ensure_admin(&guard, actor, "update space status")?;
        let current = guard
            .space(space_id)
            .ok_or_else(|| EngineError::SpaceNotFound {
                location_id,
                space_id: space_id.to_string(),
            })?
            .status;

        if status == SpaceStatus::Maintenance {
            let now = self.now();
            let upto = tl_guard.bookings.partition_point(|b| b.span.start <= now);
            if let Some(b) = tl_guard.bookings[..upto]
                .iter()
                .find(|b| b.status.blocks_space() && now <= b.span.end)
            {
                return Err(EngineError::ActiveBookingConflict {
                    space_id: space_id.to_string(),
                    booking_id: b.id,
                });
            }
        }

        if current == status {
            return Ok(Vec::new());
        }

        let events = [Event::SpaceStatusChanged {
            location_id,
            space_id: space_id.to_string(),
            status,
            held_by: None,
        }];
        self.commit_once(&events).await?;
        self.apply_location_events(&mut guard, &events);
        info!("space {location_id}/{space_id}: {current:?} -> {status:?} by {actor}");
        Ok(space_notifications(&events))
    }
}
