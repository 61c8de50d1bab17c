use crate::model::Ms;

pub const MAX_LOCATIONS: usize = 10_000;
pub const MAX_SPACES_PER_LOCATION: usize = 5_000;
pub const MAX_BOOKINGS_PER_SPACE: usize = 100_000;
pub const MAX_EXTENSIONS_PER_BOOKING: usize = 32;
pub const MAX_PENALTIES_PER_BOOKING: usize = 64;
pub const MAX_BULK_UPDATES: usize = 1_000;
pub const MAX_ADMINS_PER_LOCATION: usize = 64;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ID_LEN: usize = 64;
pub const MAX_PLATE_LEN: usize = 16;
pub const MAX_TEXT_LEN: usize = 1024;

/// Earliest accepted timestamp: 2000-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// Latest accepted timestamp: 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single booking may not exceed 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;
/// Read-side queries (free windows) may not span more than 92 days.
pub const MAX_QUERY_WINDOW_MS: Ms = 92 * 24 * 3_600_000;
/// Smallest slot width accepted for slot enumeration.
pub const MIN_SLOT_WIDTH_MS: Ms = 5 * 60_000;
