//! Time-related helpers used when rendering messages.

use chrono::{DateTime, FixedOffset, Local, TimeZone};

/// Current wall-clock time in the local timezone.
pub fn now_local() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}

/// Build a timestamp from Unix milliseconds in the given offset.
///
/// Returns `None` when the value is outside chrono's supported range.
pub fn timestamp_from_millis(millis: i64, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    offset.timestamp_millis_opt(millis).single()
}

/// Format a timestamp as `HH:MM:SS`.
pub fn format_time_of_day(timestamp: &DateTime<FixedOffset>) -> String {
    timestamp.format("%H:%M:%S").to_string()
}
