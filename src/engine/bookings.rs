use tracing::{debug, info};
use ulid::Ulid;

use crate::lifecycle::{self, reconcile_state};
use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::pricing::RefundQuote;
use crate::retry::RetryPolicy;

use super::conflict::{ensure_no_conflict, validate_span};
use super::{booking_notification, ensure_admin, payment_notification, space_notifications, Engine, EngineError};

#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub booking: Booking,
    pub refund: RefundQuote,
}

/// What a booking transition does to the stored space status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpaceIntent {
    Keep,
    /// available → reserved, held by this booking.
    Hold,
    /// → occupied, held by this booking.
    Occupy,
    /// Only if this booking holds the space: passes the hold to the next
    /// blocking booking, or frees the space.
    Release,
}

/// Who a released space passes to: a checked-in booking first, else the
/// earliest confirmed one.
fn next_holder(tl: &SpaceTimeline, released: Ulid) -> Option<&Booking> {
    let mut next = None;
    for o in tl.bookings.iter().filter(|o| o.id != released && o.status.blocks_space()) {
        if o.status == BookingStatus::Active {
            return Some(o);
        }
        next = next.or(Some(o));
    }
    next
}

fn space_event(loc: &ParkingLocation, tl: &SpaceTimeline, b: &Booking, intent: SpaceIntent) -> Option<Event> {
    let space = loc.space(&b.space_id)?;
    let (status, held_by) = match intent {
        SpaceIntent::Keep => return None,
        SpaceIntent::Hold if space.status == SpaceStatus::Available => (SpaceStatus::Reserved, Some(b.id)),
        SpaceIntent::Occupy if space.status != SpaceStatus::Maintenance => (SpaceStatus::Occupied, Some(b.id)),
        SpaceIntent::Release if space.held_by == Some(b.id) => match next_holder(tl, b.id) {
            Some(next) if next.status == BookingStatus::Active => (SpaceStatus::Occupied, Some(next.id)),
            Some(next) => (SpaceStatus::Reserved, Some(next.id)),
            None => (SpaceStatus::Available, None),
        },
        _ => return None,
    };
    Some(Event::SpaceStatusChanged {
        location_id: loc.id,
        space_id: b.space_id.clone(),
        status,
        held_by,
    })
}

fn validate_request(req: &BookingRequest, now: Ms) -> Result<(), EngineError> {
    if req.user_id.trim().is_empty() {
        return Err(EngineError::validation("user id must not be empty"));
    }
    if req.user_id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    let plate = req.vehicle.plate_number.trim();
    if plate.is_empty() {
        return Err(EngineError::validation("plate number must not be empty"));
    }
    if plate.len() > MAX_PLATE_LEN {
        return Err(EngineError::LimitExceeded("plate number too long"));
    }
    validate_span(&req.span)?;
    if req.span.start <= now {
        return Err(EngineError::validation("start time must be in the future"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let now = self.now();
        validate_request(&req, now)?;

        let key = SpaceKey::new(req.location_id, req.space_id.clone());
        let tl = self.timeline(&key)?;
        let mut tl_guard = tl.write().await;
        let loc = self.location(&req.location_id)?;
        let mut loc_guard = loc.write().await;

        if !loc_guard.is_active {
            return Err(EngineError::validation("location is not active"));
        }
        if !loc_guard.operating_hours.is_open_at(now) {
            return Err(EngineError::validation("location is currently closed"));
        }
        let space = loc_guard.space(&req.space_id).ok_or_else(|| EngineError::SpaceNotFound {
            location_id: req.location_id,
            space_id: req.space_id.clone(),
        })?;
        if space.status == SpaceStatus::Maintenance {
            return Err(EngineError::validation("space is under maintenance"));
        }
        if tl_guard.bookings.len() >= MAX_BOOKINGS_PER_SPACE {
            return Err(EngineError::LimitExceeded("too many bookings on space"));
        }

        ensure_no_conflict(&tl_guard, &req.span, None)?;

        let total_amount = self
            .config
            .pricing
            .base_amount(&req.span, loc_guard.hourly_rate, space.space_type);
        let immediate = req.payment_method.is_immediate();
        let booking = Booking {
            id: Ulid::new(),
            user_id: req.user_id,
            location_id: req.location_id,
            space_id: req.space_id,
            vehicle: VehicleInfo::new(&req.vehicle.plate_number, req.vehicle.vehicle_type),
            span: req.span,
            actual_entry: None,
            actual_exit: None,
            status: if immediate {
                BookingStatus::Confirmed
            } else {
                BookingStatus::Pending
            },
            payment_method: req.payment_method,
            payment_status: if immediate {
                PaymentStatus::Completed
            } else {
                PaymentStatus::Pending
            },
            total_amount,
            extensions: Vec::new(),
            penalties: Vec::new(),
            cancellation: None,
            qr_code: format!("PKS-{}", Ulid::new()),
            created_at: now,
            updated_at: now,
        };

        let intent = if immediate { SpaceIntent::Hold } else { SpaceIntent::Keep };
        let retry = self.config.commit_retry.clone();
        let notifications = self
            .commit_booking(&mut tl_guard, &mut loc_guard, booking.clone(), true, intent, &retry)
            .await?;
        drop(loc_guard);
        drop(tl_guard);

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            "booking {} created for {} on {} ({})",
            booking.id,
            booking.user_id,
            key,
            booking.status
        );
        self.publish_committed(&notifications).await;
        Ok(booking)
    }

    /// Gateway callback: payment cleared. Pending bookings never block the
    /// timeline, so the conflict check runs again before confirming.
    pub async fn confirm_payment(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let (b, ()) = self
            .transition(booking_id, SpaceIntent::Hold, RetryPolicy::none(), |b, _, tl, now| {
                lifecycle::confirm_payment(b, now)?;
                ensure_no_conflict(tl, &b.span, Some(b.id))
            })
            .await?;
        self.publish(&[payment_notification(&b)]);
        Ok(b)
    }

    pub async fn fail_payment(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let (b, ()) = self
            .transition(booking_id, SpaceIntent::Release, RetryPolicy::none(), |b, _, _, now| {
                lifecycle::fail_payment(b, now)
            })
            .await?;
        self.publish(&[payment_notification(&b)]);
        Ok(b)
    }

    pub async fn check_in(&self, booking_id: Ulid, presented_qr: Option<&str>) -> Result<Booking, EngineError> {
        let (b, ()) = self
            .transition(booking_id, SpaceIntent::Occupy, RetryPolicy::none(), |b, loc, _, now| {
                if loc
                    .space(&b.space_id)
                    .is_some_and(|s| s.status == SpaceStatus::Maintenance)
                {
                    return Err(EngineError::validation("space is under maintenance"));
                }
                lifecycle::check_in(b, now, presented_qr)
            })
            .await?;
        Ok(b)
    }

    pub async fn check_out(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let policy = self.config.pricing.clone();
        let (b, charge) = self
            .transition(booking_id, SpaceIntent::Release, RetryPolicy::none(), |b, loc, _, now| {
                lifecycle::check_out(b, now, loc.hourly_rate, &policy)
            })
            .await?;
        if let Some(c) = charge {
            info!("booking {booking_id} overstayed {}h, penalty {}", c.hours, c.amount);
        }
        Ok(b)
    }

    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        requester: &str,
        reason: Option<String>,
    ) -> Result<CancelOutcome, EngineError> {
        let policy = self.config.pricing.clone();
        let (booking, refund) = self
            .transition(booking_id, SpaceIntent::Release, RetryPolicy::none(), |b, _, _, now| {
                lifecycle::cancel(b, requester, reason, now, &policy)
            })
            .await?;
        if refund.amount > 0 {
            self.publish(&[payment_notification(&booking)]);
        }
        Ok(CancelOutcome { booking, refund })
    }

    /// Only the delta `[old_end, new_end)` is checked, excluding this booking.
    pub async fn extend_booking(&self, booking_id: Ulid, requester: &str, new_end: Ms) -> Result<Booking, EngineError> {
        let policy = self.config.pricing.clone();
        let retry = self.config.commit_retry.clone();
        let (b, ()) = self
            .transition(booking_id, SpaceIntent::Keep, retry, |b, loc, tl, now| {
                let delta = lifecycle::extension_window(b, requester, new_end)?;
                validate_span(&delta)?;
                ensure_no_conflict(tl, &delta, Some(b.id))?;
                let amount = policy.extension_amount(b.span.end, new_end, loc.hourly_rate);
                lifecycle::apply_extension(b, new_end, amount, now);
                Ok(())
            })
            .await?;
        Ok(b)
    }

    pub async fn mark_no_show(&self, booking_id: Ulid, actor: &str) -> Result<Booking, EngineError> {
        let (b, ()) = self
            .transition(booking_id, SpaceIntent::Release, RetryPolicy::none(), |b, loc, _, now| {
                ensure_admin(loc, actor, "mark no-show")?;
                lifecycle::mark_no_show(b, now)
            })
            .await?;
        Ok(b)
    }

    pub async fn issue_penalty(
        &self,
        booking_id: Ulid,
        kind: PenaltyKind,
        amount: Money,
        description: String,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        let (b, ()) = self
            .transition(booking_id, SpaceIntent::Keep, RetryPolicy::none(), |b, loc, _, now| {
                ensure_admin(loc, actor, "issue penalties")?;
                lifecycle::issue_penalty(
                    b,
                    Penalty {
                        kind,
                        amount,
                        description,
                        issued_at: now,
                        is_paid: false,
                    },
                )
            })
            .await?;
        Ok(b)
    }

    pub async fn settle_penalties(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let (b, settled) = self
            .transition(booking_id, SpaceIntent::Keep, RetryPolicy::none(), |b, _, _, now| {
                Ok(lifecycle::settle_penalties(b, now))
            })
            .await?;
        debug!("settled {settled} penalties on booking {booking_id}");
        Ok(b)
    }

    /// Expire the booking if it is due at the current time. Returns the
    /// expired booking, or `None` if nothing changed.
    pub async fn expire_booking(&self, booking_id: Ulid) -> Result<Option<Booking>, EngineError> {
        let (_, mut tl_guard) = self.resolve_booking_write(&booking_id).await?;
        let loc = self.location(&tl_guard.key.location_id)?;
        let mut loc_guard = loc.write().await;
        let current = tl_guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let now = self.now();
        let Some((expired, notifications)) = self
            .expire_if_due(&mut tl_guard, &mut loc_guard, &current, now)
            .await?
        else {
            return Ok(None);
        };
        drop(loc_guard);
        drop(tl_guard);
        self.publish_committed(&notifications).await;
        Ok(Some(expired))
    }

    /// Bookings due to expire at `now`. Contended timelines are skipped and
    /// picked up by the next sweep.
    pub fn collect_expirable(&self, now: Ms) -> Vec<Ulid> {
        let grace = self.config.active_grace_ms;
        let mut due = Vec::new();
        for entry in self.timelines.iter() {
            let Ok(tl) = entry.value().try_read() else {
                continue;
            };
            due.extend(
                tl.bookings
                    .iter()
                    .filter(|b| reconcile_state(b, now, grace).is_some())
                    .map(|b| b.id),
            );
        }
        due
    }

    /// Persist the reconciled expiry of `current`, if one is due.
    pub(super) async fn expire_if_due(
        &self,
        tl: &mut SpaceTimeline,
        loc: &mut ParkingLocation,
        current: &Booking,
        now: Ms,
    ) -> Result<Option<(Booking, Vec<Notification>)>, EngineError> {
        if reconcile_state(current, now, self.config.active_grace_ms).is_none() {
            return Ok(None);
        }
        let mut expired = current.clone();
        lifecycle::expire(&mut expired, now)?;
        let notifications = self
            .commit_booking(tl, loc, expired.clone(), false, SpaceIntent::Release, &RetryPolicy::none())
            .await?;
        metrics::counter!(crate::observability::BOOKINGS_EXPIRED_TOTAL).increment(1);
        info!("booking {} expired (was {})", expired.id, current.status);
        Ok(Some((expired, notifications)))
    }

    /// Lock, reconcile, run `f` on a copy of the booking, then commit the
    /// booking snapshot together with any space-status change.
    ///
    /// An overdue booking is expired (and persisted) before `f` runs, so `f`
    /// sees the reconciled status; if `f` then rejects, the expiry stands.
    async fn transition<F, R>(
        &self,
        booking_id: Ulid,
        intent: SpaceIntent,
        retry: RetryPolicy,
        f: F,
    ) -> Result<(Booking, R), EngineError>
    where
        F: FnOnce(&mut Booking, &ParkingLocation, &SpaceTimeline, Ms) -> Result<R, EngineError>,
    {
        let (_, mut tl_guard) = self.resolve_booking_write(&booking_id).await?;
        let loc = self.location(&tl_guard.key.location_id)?;
        let mut loc_guard = loc.write().await;
        let now = self.now();

        let mut current = tl_guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let mut notifications = Vec::new();
        if let Some((expired, mut n)) = self
            .expire_if_due(&mut tl_guard, &mut loc_guard, &current, now)
            .await?
        {
            current = expired;
            notifications.append(&mut n);
        }

        let mut b = current.clone();
        let outcome = match f(&mut b, &loc_guard, &tl_guard, now) {
            Ok(r) if b == current => Ok(r),
            Ok(r) => self
                .commit_booking(&mut tl_guard, &mut loc_guard, b.clone(), false, intent, &retry)
                .await
                .map(|mut n| {
                    notifications.append(&mut n);
                    r
                }),
            Err(e) => Err(e),
        };
        drop(loc_guard);
        drop(tl_guard);

        self.publish_committed(&notifications).await;
        outcome.map(|r| (b, r))
    }

    /// Commit a booking snapshot and its space-status effect as one WAL
    /// record, apply both, and return the notifications to publish.
    async fn commit_booking(
        &self,
        tl: &mut SpaceTimeline,
        loc: &mut ParkingLocation,
        booking: Booking,
        created: bool,
        intent: SpaceIntent,
        retry: &RetryPolicy,
    ) -> Result<Vec<Notification>, EngineError> {
        let space_change = space_event(loc, tl, &booking, intent);
        let mut notifications = vec![booking_notification(&booking)];
        let status = booking.status;
        let mut events = vec![if created {
            Event::BookingCreated { booking }
        } else {
            Event::BookingUpdated { booking }
        }];
        events.extend(space_change);

        self.commit(&events, retry).await?;
        self.apply_booking_events(tl, &events);
        self.apply_location_events(loc, &events);

        metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "status" => status.as_str()).increment(1);
        notifications.extend(space_notifications(&events));
        Ok(notifications)
    }
}
