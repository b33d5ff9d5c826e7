//! Wall-clock helpers shared across the controller.

use chrono::{TimeZone, Utc};

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Formats an epoch-millisecond timestamp as an RFC 3339 string.
///
/// Returns `None` for timestamps outside the representable chrono range.
pub fn ms_to_iso(ts_ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.to_rfc3339())
}
