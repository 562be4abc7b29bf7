use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single allocation or maintenance window may not exceed ~10 years.
pub const MAX_SPAN_DURATION_MS: Ms = 3_660 * DAY_MS;
/// Schedule and range listing windows.
pub const MAX_QUERY_WINDOW_MS: Ms = 3_660 * DAY_MS;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4_096;
pub const MAX_PASSWORD_LEN: usize = 1_024;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_INTERVALS_PER_RESOURCE: usize = 100_000;

/// Highest `$N` placeholder accepted in a prepared statement.
pub const MAX_QUERY_PARAMS: usize = 1_024;
