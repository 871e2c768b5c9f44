//! Small time helpers shared by the hub and its extensions.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in whole seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current Unix timestamp in milliseconds. Heartbeat pings carry this,
/// stringified, so acknowledgments can be matched exactly.
pub fn current_timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Current Unix timestamp as fractional seconds, used for ordering chat
/// history entries.
pub fn current_timestamp_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
