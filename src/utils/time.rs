use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix seconds; expirations are stored in this
/// domain.
#[inline]
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Current wall-clock time in nanoseconds since the epoch, for the HLC.
#[inline]
pub fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Seconds until the next occurrence of the given wall-clock hour (0-23).
pub fn secs_until_hour(hour: u32) -> u64 {
    let now = unix_now() as u64;
    let secs_today = now % 86_400;
    let target = u64::from(hour.min(23)) * 3600;
    if target > secs_today {
        target - secs_today
    } else {
        86_400 - secs_today + target
    }
}
