use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time as unix milliseconds, the unit every event carries.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
