//! Wall-clock helpers. Store deadlines and schedule scores are epoch millis
//! so every process agrees on them.

use std::time::Duration;

use chrono::Utc;

/// Current wall-clock time in epoch milliseconds.
#[inline]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Epoch milliseconds `after` from now, saturating on overflow.
pub fn deadline_after(after: Duration) -> i64 {
    let millis = i64::try_from(after.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_add(millis)
}
