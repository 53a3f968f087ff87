use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

static MONOTONIC_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds on a process-local monotonic clock.
///
/// Used for everything that compares ages, so that wall-clock adjustments
/// cannot make a live receiver look stale.
pub fn now_monotonic_secs() -> i64 {
    MONOTONIC_START.elapsed().as_secs() as i64
}

/// Seconds since the UNIX epoch.
pub fn now_realtime_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
