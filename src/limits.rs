use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// One year. Longer stays are almost certainly a typo in the end date.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
/// Windows for arrivals/departures/free-window queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * 24 * 3_600_000;

pub const MAX_RESOURCES_PER_FACILITY: usize = 10_000;
pub const MAX_RESERVATIONS_PER_FACILITY: usize = 1_000_000;
pub const MAX_RESOURCE_ID_LEN: usize = 64;
pub const MAX_ZONE_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 64;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_PARTY_SIZE: u32 = 10_000;
pub const MAX_SEARCH_TERM_LEN: usize = 256;

pub const MAX_FACILITIES: usize = 1_000;
pub const MAX_FACILITY_NAME_LEN: usize = 128;
