use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Amount in the smallest currency unit.
pub type Money = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Whole hours covering `ms`, rounded up. Non-positive durations are zero hours.
pub fn ceil_hours(ms: Ms) -> i64 {
    if ms <= 0 {
        0
    } else {
        (ms + HOUR_MS - 1) / HOUR_MS
    }
}

/// `(total - available) / total * 100`, or 0 for a location without spaces.
pub fn occupancy_percentage(total: u32, available: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let occupied = total.saturating_sub(available);
    f64::from(occupied) / f64::from(total) * 100.0
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Billable hours: duration rounded up to the next whole hour.
    pub fn billable_hours(&self) -> i64 {
        ceil_hours(self.duration_ms())
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Identifies one space's reservation timeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpaceKey {
    pub location_id: Ulid,
    pub space_id: String,
}

impl SpaceKey {
    pub fn new(location_id: Ulid, space_id: impl Into<String>) -> Self {
        Self {
            location_id,
            space_id: space_id.into(),
        }
    }
}

impl fmt::Display for SpaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.location_id, self.space_id)
    }
}

// ── Locations & spaces ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpaceType {
    Regular,
    Handicapped,
    EvCharging,
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceStatus {
    Available,
    Occupied,
    Maintenance,
    Reserved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkingSpace {
    pub space_id: String,
    pub space_type: SpaceType,
    pub status: SpaceStatus,
    /// Booking that flipped this space to reserved/occupied, if any.
    pub held_by: Option<Ulid>,
}

impl ParkingSpace {
    pub fn new(space_id: impl Into<String>, space_type: SpaceType) -> Self {
        Self {
            space_id: space_id.into(),
            space_type,
            status: SpaceStatus::Available,
            held_by: None,
        }
    }
}

/// Daily opening window, evaluated in UTC. `close <= open` means the window
/// runs past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub is_24_hours: bool,
}

impl OperatingHours {
    pub fn always() -> Self {
        Self {
            open: NaiveTime::MIN,
            close: NaiveTime::MIN,
            is_24_hours: true,
        }
    }

    pub fn daily(open: NaiveTime, close: NaiveTime) -> Self {
        Self {
            open,
            close,
            is_24_hours: false,
        }
    }

    pub fn is_open_at(&self, t: Ms) -> bool {
        if self.is_24_hours {
            return true;
        }
        let Some(dt) = DateTime::<Utc>::from_timestamp_millis(t) else {
            return false;
        };
        let tod = dt.time();
        if self.open < self.close {
            self.open <= tod && tod < self.close
        } else {
            tod >= self.open || tod < self.close
        }
    }

    /// Opening window for the given calendar day.
    pub fn window_on(&self, date: NaiveDate) -> Span {
        let day_start = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
        if self.is_24_hours {
            return Span::new(day_start, day_start + DAY_MS);
        }
        let open = day_start + ms_of_day(self.open);
        let mut close = day_start + ms_of_day(self.close);
        if close <= open {
            close += DAY_MS;
        }
        Span::new(open, close)
    }
}

fn ms_of_day(t: NaiveTime) -> Ms {
    Ms::from(t.num_seconds_from_midnight()) * 1000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkingLocation {
    pub id: Ulid,
    pub name: String,
    pub hourly_rate: Money,
    pub operating_hours: OperatingHours,
    pub is_active: bool,
    /// Actors allowed to administer this location.
    pub admins: Vec<String>,
    pub spaces: Vec<ParkingSpace>,
    /// Count of spaces whose status is available. Recomputed by every status write.
    pub available_spaces: u32,
}

impl ParkingLocation {
    pub fn total_spaces(&self) -> u32 {
        self.spaces.len() as u32
    }

    pub fn space(&self, space_id: &str) -> Option<&ParkingSpace> {
        self.spaces.iter().find(|s| s.space_id == space_id)
    }

    pub fn space_mut(&mut self, space_id: &str) -> Option<&mut ParkingSpace> {
        self.spaces.iter_mut().find(|s| s.space_id == space_id)
    }

    pub fn is_admin(&self, actor: &str) -> bool {
        self.admins.iter().any(|a| a == actor)
    }

    pub fn recount_available(&mut self) -> u32 {
        self.available_spaces = self
            .spaces
            .iter()
            .filter(|s| s.status == SpaceStatus::Available)
            .count() as u32;
        self.available_spaces
    }
}

/// Input for creating a location (also the seed-file record format).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLocation {
    pub name: String,
    pub hourly_rate: Money,
    pub operating_hours: OperatingHours,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub spaces: Vec<NewSpace>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSpace {
    pub space_id: String,
    pub space_type: SpaceType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationPatch {
    pub name: Option<String>,
    pub hourly_rate: Option<Money>,
    pub operating_hours: Option<OperatingHours>,
    pub is_active: Option<bool>,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Car,
    Motorcycle,
    Bus,
    Truck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub plate_number: String,
    pub vehicle_type: VehicleType,
}

impl VehicleInfo {
    /// Plate numbers are stored trimmed and uppercase.
    pub fn new(plate_number: &str, vehicle_type: VehicleType) -> Self {
        Self {
            plate_number: plate_number.trim().to_uppercase(),
            vehicle_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Paypal,
    Esewa,
}

impl PaymentMethod {
    /// Cash is settled on the spot; everything else waits for a gateway callback.
    pub fn is_immediate(self) -> bool {
        matches!(self, PaymentMethod::Cash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
    PartialRefund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
    Expired,
    NoShow,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed
                | BookingStatus::Cancelled
                | BookingStatus::Expired
                | BookingStatus::NoShow
        )
    }

    /// Statuses that occupy the space's timeline for conflict purposes.
    pub fn blocks_space(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Active => "active",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Expired => "expired",
            BookingStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub original_end: Ms,
    pub new_end: Ms,
    pub additional_amount: Money,
    pub requested_at: Ms,
    pub approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyKind {
    Overstay,
    Damage,
    Violation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Penalty {
    pub kind: PenaltyKind,
    pub amount: Money,
    pub description: String,
    pub issued_at: Ms,
    pub is_paid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub cancelled_at: Ms,
    pub cancelled_by: String,
    pub reason: Option<String>,
    pub refund_amount: Money,
    pub refund_percentage: u8,
    pub refund_status: RefundStatus,
}

/// Everything the caller supplies to reserve a space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub user_id: String,
    pub location_id: Ulid,
    pub space_id: String,
    pub vehicle: VehicleInfo,
    pub span: Span,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: String,
    pub location_id: Ulid,
    pub space_id: String,
    pub vehicle: VehicleInfo,
    pub span: Span,
    pub actual_entry: Option<Ms>,
    pub actual_exit: Option<Ms>,
    pub status: BookingStatus,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub total_amount: Money,
    pub extensions: Vec<Extension>,
    pub penalties: Vec<Penalty>,
    pub cancellation: Option<Cancellation>,
    /// Opaque token presented at the gate.
    pub qr_code: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn key(&self) -> SpaceKey {
        SpaceKey::new(self.location_id, self.space_id.clone())
    }

    pub fn duration_hours(&self) -> i64 {
        self.span.billable_hours()
    }

    pub fn actual_duration_hours(&self) -> i64 {
        match (self.actual_entry, self.actual_exit) {
            (Some(entry), Some(exit)) => ceil_hours(exit - entry),
            _ => 0,
        }
    }

    pub fn total_penalties(&self) -> Money {
        self.penalties.iter().map(|p| p.amount).sum()
    }

    pub fn unpaid_penalties(&self) -> Money {
        self.penalties
            .iter()
            .filter(|p| !p.is_paid)
            .map(|p| p.amount)
            .sum()
    }

    pub fn final_amount(&self) -> Money {
        self.total_amount + self.total_penalties()
    }
}

/// All bookings for one space, sorted by `span.start`. Terminal bookings are
/// retained; only confirmed/active ones block the timeline.
#[derive(Debug, Clone)]
pub struct SpaceTimeline {
    pub key: SpaceKey,
    pub bookings: Vec<Booking>,
}

impl SpaceTimeline {
    pub fn new(key: SpaceKey) -> Self {
        Self {
            key,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    /// Replace a booking by id. Start times never change, so order is kept.
    pub fn replace_booking(&mut self, booking: Booking) -> bool {
        match self.bookings.iter_mut().find(|b| b.id == booking.id) {
            Some(slot) => {
                *slot = booking;
                true
            }
            None => false,
        }
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Overlapping bookings that hold the space (confirmed or active).
    pub fn blocking(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.status.blocks_space())
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LocationCreated {
        location: ParkingLocation,
    },
    LocationUpdated {
        id: Ulid,
        name: String,
        hourly_rate: Money,
        operating_hours: OperatingHours,
        is_active: bool,
    },
    SpaceAdded {
        location_id: Ulid,
        space: ParkingSpace,
    },
    SpaceStatusChanged {
        location_id: Ulid,
        space_id: String,
        status: SpaceStatus,
        held_by: Option<Ulid>,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Full snapshot of a booking after a lifecycle transition.
    BookingUpdated {
        booking: Booking,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occupancy {
    pub location_id: Ulid,
    pub total_spaces: u32,
    pub available_spaces: u32,
    pub occupancy_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
    pub available: bool,
    pub price: Money,
}

/// Summary of a booking that blocked a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub booking_id: Ulid,
    pub user_id: String,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
}

impl From<&Booking> for ConflictInfo {
    fn from(b: &Booking) -> Self {
        Self {
            booking_id: b.id,
            user_id: b.user_id.clone(),
            start: b.span.start,
            end: b.span.end,
            status: b.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceStatusUpdate {
    pub space_id: String,
    pub status: SpaceStatus,
}
