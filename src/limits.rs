use crate::model::{DAY_MS, Ms};

/// Longest accepted free-text field (model, name, address, ...).
pub const MAX_TEXT_LEN: usize = 256;

/// Passenger ids accepted in a single booking request.
pub const MAX_PASSENGERS_PER_BOOKING: usize = 500;

/// Records of any single kind (vehicles, drivers, trips, ...).
pub const MAX_RECORDS_PER_KIND: usize = 1_000_000;

/// Scheduled trips on a single vehicle or driver timeline.
pub const MAX_COMMITMENTS_PER_RESOURCE: usize = 100_000;

/// A single trip may not last longer than a year.
pub const MAX_TRIP_DURATION_MS: Ms = 366 * DAY_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
