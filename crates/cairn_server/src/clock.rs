//! Microsecond wall-clock helpers shared by the queue and scheduler headers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as microseconds since the Unix epoch.
///
/// Scheduling headers (`commandExecuteTime`) carry absolute values in this
/// unit, so the queue compares against the same clock.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Convert a relative millisecond span to microseconds.
pub fn ms_to_us(ms: u64) -> u64 {
    ms.saturating_mul(1000)
}
