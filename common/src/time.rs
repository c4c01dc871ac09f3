// Time types used across the ledger.
//
// Timestamps here come from the host clock and are NON-DETERMINISTIC.
// They are safe for created_at columns, TTL management and worker
// scheduling. Hashed event payloads capture a timestamp once at append
// time and never re-derive it.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Millis timestamps, used to determine it by its type
pub type TimestampMillis = u64;

#[inline]
pub fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
}

// Return timestamp in milliseconds
// We cast to u64 as we have plenty of time before it overflows
pub fn now_millis() -> TimestampMillis {
    get_current_time().as_millis() as TimestampMillis
}

pub const MILLIS_PER_MINUTE: u64 = 60 * 1000;
pub const MILLIS_PER_HOUR: u64 = 60 * MILLIS_PER_MINUTE;
pub const MILLIS_PER_DAY: u64 = 24 * MILLIS_PER_HOUR;
